//! Standard SMM panel API client.
//!
//! Most panels expose one endpoint taking a form-encoded POST keyed by
//! `action`:
//!
//! | action     | params                   | answer                                   |
//! |------------|--------------------------|------------------------------------------|
//! | `add`      | service, link, quantity  | `{order}`                                |
//! | `status`   | order                    | `{status, start_count, remains, ...}`    |
//! | `balance`  |                          | `{balance, currency}`                    |
//! | `services` |                          | `[{service, name, rate, min, max, ...}]` |
//! | `cancel`   | order                    | `{cancelled}`                            |
//!
//! Any action may answer `{error}` instead. Panels disagree on whether
//! numbers are JSON numbers or strings, so both are accepted.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use smm_domain::{ApiKey, StatusReport, UpstreamStatus};
use smm_exec::{
    CreateOrderRequest, ExecError, ExecResult, UpstreamBalance, UpstreamPort, UpstreamService,
};

// =============================================================================
// Constants
// =============================================================================

/// Request timeout when none is configured
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the standard panel client.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// HTTP request failed (connect, TLS, 5xx)
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// Provider answered with an explicit error
    #[error("Provider API error: {msg}")]
    ApiError { msg: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl From<UpstreamError> for ExecError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::ApiError { msg } => ExecError::UpstreamRejected(msg),
            // An unreadable body is usually a proxy error page.
            other => ExecError::UpstreamTransient(other.to_string()),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client for one provider speaking the standard panel API.
pub struct StandardSmmClient {
    client: Client,
    api_url: String,
    api_key: ApiKey,
    timeout: Duration,
}

impl StandardSmmClient {
    /// Create a client with its own connection pool.
    pub fn new(api_url: impl Into<String>, api_key: ApiKey, timeout: Duration) -> Self {
        Self::with_client(Client::new(), api_url, api_key, timeout)
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_client(
        client: Client,
        api_url: impl Into<String>,
        api_key: ApiKey,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key,
            timeout,
        }
    }

    /// POST one action and return the parsed JSON body.
    async fn call(&self, action: &str, params: &[(&str, String)]) -> Result<Value, UpstreamError> {
        let mut form: Vec<(&str, &str)> = vec![("key", self.api_key.expose()), ("action", action)];
        form.extend(params.iter().map(|(k, v)| (*k, v.as_str())));

        debug!(action, url = %self.api_url, "Calling provider");

        let response = timeout(self.timeout, self.client.post(&self.api_url).form(&form).send())
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        let body = timeout(self.timeout, response.text())
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| UpstreamError::RequestFailed(e.to_string()))?;

        let parsed = serde_json::from_str::<Value>(&body);
        if let Ok(value) = &parsed {
            if let Some(msg) = error_message(value) {
                return Err(UpstreamError::ApiError { msg });
            }
        }

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(UpstreamError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(UpstreamError::ApiError {
                msg: format!("HTTP {}: {}", status, body),
            });
        }

        parsed.map_err(|e| UpstreamError::ParseError(e.to_string()))
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// `action=add`: submit an order, returning the provider order id.
    pub async fn add_order(
        &self,
        service: &str,
        link: &str,
        quantity: u32,
    ) -> Result<String, UpstreamError> {
        let body = self
            .call(
                "add",
                &[
                    ("service", service.to_string()),
                    ("link", link.to_string()),
                    ("quantity", quantity.to_string()),
                ],
            )
            .await?;

        body.get("order")
            .and_then(text)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UpstreamError::ParseError(format!("no order id in {}", body)))
    }

    /// `action=status`: progress of one order.
    pub async fn order_status(&self, order: &str) -> Result<StatusReport, UpstreamError> {
        let body = self.call("status", &[("order", order.to_string())]).await?;

        let status = body
            .get("status")
            .and_then(text)
            .ok_or_else(|| UpstreamError::ParseError(format!("no status in {}", body)))?;

        Ok(StatusReport {
            status: UpstreamStatus::parse(&status),
            start_count: optional_count(&body, "start_count")?.unwrap_or(0),
            remains: optional_count(&body, "remains")?.unwrap_or(0),
        })
    }

    /// `action=balance`: funds held with the provider.
    pub async fn balance(&self) -> Result<UpstreamBalance, UpstreamError> {
        let body = self.call("balance", &[]).await?;
        Ok(UpstreamBalance {
            balance: decimal(&body, "balance")?,
            currency: body.get("currency").and_then(text).unwrap_or_default(),
        })
    }

    /// `action=services`: the provider catalog.
    pub async fn services(&self) -> Result<Vec<UpstreamService>, UpstreamError> {
        let body = self.call("services", &[]).await?;
        let entries = body
            .as_array()
            .ok_or_else(|| UpstreamError::ParseError("services answer is not a list".to_string()))?;

        entries
            .iter()
            .map(|entry| {
                let service = entry
                    .get("service")
                    .and_then(text)
                    .ok_or_else(|| UpstreamError::ParseError(format!("no service id in {}", entry)))?;
                Ok(UpstreamService {
                    name: entry.get("name").and_then(text).unwrap_or_else(|| service.clone()),
                    rate: decimal(entry, "rate")?,
                    min: bound(entry, "min")?,
                    max: bound(entry, "max")?,
                    kind: entry.get("type").and_then(text),
                    category: entry.get("category").and_then(text),
                    service,
                })
            })
            .collect()
    }

    /// `action=cancel`: ask the provider to cancel an order.
    pub async fn cancel(&self, order: &str) -> Result<bool, UpstreamError> {
        let body = self.call("cancel", &[("order", order.to_string())]).await?;
        Ok(match body.get("cancelled").or_else(|| body.get("cancel")) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "yes"),
            _ => false,
        })
    }
}

impl std::fmt::Debug for StandardSmmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardSmmClient")
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UpstreamPort for StandardSmmClient {
    async fn create_order(&self, request: &CreateOrderRequest) -> ExecResult<String> {
        Ok(self
            .add_order(
                &request.service_ref.upstream_service_id,
                request.link.as_str(),
                request.quantity,
            )
            .await?)
    }

    async fn get_status(&self, upstream_order_id: &str) -> ExecResult<StatusReport> {
        Ok(self.order_status(upstream_order_id).await?)
    }

    async fn get_balance(&self) -> ExecResult<UpstreamBalance> {
        Ok(self.balance().await?)
    }

    async fn get_services(&self) -> ExecResult<Vec<UpstreamService>> {
        Ok(self.services().await?)
    }

    async fn cancel_order(&self, upstream_order_id: &str) -> ExecResult<bool> {
        Ok(self.cancel(upstream_order_id).await?)
    }
}

// =============================================================================
// Lenient field parsing
// =============================================================================

fn error_message(value: &Value) -> Option<String> {
    value.get("error").and_then(text).filter(|msg| !msg.is_empty())
}

/// String or number as trimmed text.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(value: &Value, field: &str) -> Result<Decimal, UpstreamError> {
    let raw = value
        .get(field)
        .and_then(text)
        .ok_or_else(|| UpstreamError::ParseError(format!("missing {}", field)))?;
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| UpstreamError::ParseError(format!("{} is not a number: {}", field, raw)))
}

fn optional_count(value: &Value, field: &str) -> Result<Option<u64>, UpstreamError> {
    let Some(raw) = value.get(field).and_then(text).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    let parsed = Decimal::from_str(&raw)
        .ok()
        .filter(|d| !d.is_sign_negative())
        .and_then(|d| d.trunc().to_u64())
        .ok_or_else(|| UpstreamError::ParseError(format!("{} is not a count: {}", field, raw)))?;
    Ok(Some(parsed))
}

fn bound(value: &Value, field: &str) -> Result<u32, UpstreamError> {
    let count = optional_count(value, field)?
        .ok_or_else(|| UpstreamError::ParseError(format!("missing {}", field)))?;
    u32::try_from(count).map_err(|_| UpstreamError::ParseError(format!("{} out of range", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Form;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;

    /// Fake panel: answers by action, rejects a wrong key.
    async fn panel(Form(form): Form<HashMap<String, String>>) -> axum::response::Response {
        if form.get("key").map(String::as_str) != Some("secret-key") {
            return Json(json!({ "error": "Invalid API key" })).into_response();
        }
        match form.get("action").map(String::as_str) {
            Some("add") if form.get("link").map(String::as_str) == Some("bad") => {
                Json(json!({ "error": "Incorrect link" })).into_response()
            },
            Some("add") => Json(json!({ "order": 23501 })).into_response(),
            Some("status") if form.get("order").map(String::as_str) == Some("slow") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({})).into_response()
            },
            Some("status") if form.get("order").map(String::as_str) == Some("down") => {
                (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").into_response()
            },
            Some("status") => Json(json!({
                "charge": "0.27819",
                "start_count": "3572",
                "status": "Partial",
                "remains": "157",
                "currency": "USD"
            }))
            .into_response(),
            Some("balance") => Json(json!({ "balance": "100.84292", "currency": "USD" })).into_response(),
            Some("services") => Json(json!([
                { "service": 1, "name": "Followers", "type": "Default", "category": "Instagram",
                  "rate": "0.90", "min": "50", "max": "10000" },
                { "service": "2", "name": "Comments", "type": "Custom Comments", "category": "Instagram",
                  "rate": 8, "min": 10, "max": 1500 }
            ]))
            .into_response(),
            Some("cancel") => Json(json!({ "cancelled": true })).into_response(),
            _ => Json(json!({ "error": "Incorrect request" })).into_response(),
        }
    }

    async fn spawn_panel() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/api/v2", post(panel))).await.unwrap();
        });
        format!("http://{}/api/v2", addr)
    }

    fn client(url: &str, key: &str) -> StandardSmmClient {
        StandardSmmClient::new(url, ApiKey::new(key), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_add_order_numeric_id() {
        let url = spawn_panel().await;
        let id = client(&url, "secret-key")
            .add_order("1", "https://instagram.com/x", 100)
            .await
            .unwrap();
        assert_eq!(id, "23501");
    }

    #[tokio::test]
    async fn test_explicit_error_is_rejection() {
        let url = spawn_panel().await;
        let err = client(&url, "secret-key").add_order("1", "bad", 100).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ApiError { ref msg } if msg == "Incorrect link"));
        assert!(matches!(ExecError::from(err), ExecError::UpstreamRejected(_)));

        let err = client(&url, "wrong").balance().await.unwrap_err();
        assert!(matches!(err, UpstreamError::ApiError { .. }));
    }

    #[tokio::test]
    async fn test_status_with_string_numbers() {
        let url = spawn_panel().await;
        let report = client(&url, "secret-key").order_status("23501").await.unwrap();
        assert_eq!(report.status, UpstreamStatus::Partial);
        assert_eq!(report.start_count, 3572);
        assert_eq!(report.remains, 157);
    }

    #[tokio::test]
    async fn test_timeout_and_gateway_errors_are_transient() {
        let url = spawn_panel().await;
        let c = client(&url, "secret-key");

        let err = c.order_status("slow").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout));
        assert!(ExecError::from(err).is_transient());

        let err = c.order_status("down").await.unwrap_err();
        assert!(matches!(err, UpstreamError::RequestFailed(_)));
        assert!(ExecError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_balance_services_cancel() {
        let url = spawn_panel().await;
        let c = client(&url, "secret-key");

        let balance = c.get_balance().await.unwrap();
        assert_eq!(balance.balance, dec!(100.84292));
        assert_eq!(balance.currency, "USD");

        let services = c.get_services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service, "1");
        assert_eq!(services[0].rate, dec!(0.90));
        assert_eq!(services[0].min, 50);
        assert_eq!(services[1].rate, dec!(8));
        assert_eq!(services[1].kind.as_deref(), Some("Custom Comments"));

        assert!(c.cancel_order("23501").await.unwrap());
    }

    #[test]
    fn test_debug_hides_key() {
        let c = client("https://panel.example/api/v2", "secret-key");
        assert!(!format!("{:?}", c).contains("secret-key"));
    }
}
