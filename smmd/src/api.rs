//! HTTP API for the SMM daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Order placement, listing and lookup
//! - Administrative refund and re-dispatch
//! - Account balance, transactions and manual credits
//! - Upstream provider balance

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use smm_domain::{Money, Order, Transaction, TransactionKind, UserId};
use smm_exec::{
    DispatchQueue, ExecError, OrderPlacementService, PlaceOrder, RefundOutcome, RefundPath,
    UpstreamBalance, UpstreamFactory,
};
use smm_store::{Ledger, Store, StoreError};

use crate::caller::Caller;

/// Reason recorded when an admin refund carries none
const DEFAULT_REFUND_REASON: &str = "refunded by operator";

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub placement: OrderPlacementService,
    pub refunds: RefundPath,
    pub ledger: Ledger,
    pub upstreams: Arc<dyn UpstreamFactory>,
}

impl ApiState {
    /// Wire handlers to a store, queue and adapter factory.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn DispatchQueue>,
        upstreams: Arc<dyn UpstreamFactory>,
    ) -> Self {
        Self {
            placement: OrderPlacementService::new(store.clone(), queue),
            refunds: RefundPath::new(store.clone()),
            ledger: Ledger::new(store.clone()),
            store,
            upstreams,
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to place an order.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub service_id: Uuid,
    pub link: String,
    pub quantity: u32,
}

/// Request to refund an order.
#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request to credit an account.
#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: Decimal,
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Account balance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub user_id: UserId,
    pub balance: Decimal,
}

/// Result of a manual credit.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditResponse {
    pub user_id: UserId,
    pub balance: Decimal,
    pub transaction: Transaction,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/orders", post(place_order_handler).get(list_orders_handler))
        .route("/orders/:id", get(get_order_handler))
        .route("/orders/:id/refund", post(refund_handler))
        .route("/orders/:id/dispatch", post(dispatch_handler))
        .route("/account", get(account_handler))
        .route("/account/transactions", get(transactions_handler))
        .route("/accounts/:id/credit", post(credit_handler))
        .route("/providers/:id/balance", get(provider_balance_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Charge the caller and create a pending order.
async fn place_order_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Json(req): Json<PlaceOrderRequest>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = state
        .placement
        .place_order(PlaceOrder {
            user_id: caller.user_id,
            service_id: req.service_id,
            link: req.link,
            quantity: req.quantity,
        })
        .await
        .map_err(to_error_response)?;

    Ok((StatusCode::CREATED, Json(order)))
}

/// Caller's orders (all orders for admins), newest first.
async fn list_orders_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
) -> ApiResult<Json<Vec<Order>>> {
    let orders = state
        .placement
        .list_orders(caller.order_scope())
        .await
        .map_err(to_error_response)?;

    Ok(Json(orders))
}

/// Get a single order.
async fn get_order_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let order = state.placement.get_order(id).await.map_err(to_error_response)?;

    // Foreign orders look exactly like missing ones
    if !caller.can_view(&order) {
        return Err(to_error_response(ExecError::OrderNotFound(id)));
    }

    Ok(Json(order))
}

/// Refund an order (admin).
async fn refund_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundRequest>>,
) -> ApiResult<Json<RefundOutcome>> {
    caller.require_admin()?;

    let reason = body
        .and_then(|Json(req)| req.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REFUND_REASON.to_string());

    let outcome = state
        .refunds
        .refund_order(id, &reason)
        .await
        .map_err(to_error_response)?;

    Ok(Json(outcome))
}

/// Re-enqueue a pending order that never reached the queue (admin).
async fn dispatch_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    caller.require_admin()?;

    let order = state.placement.redispatch(id).await.map_err(to_error_response)?;

    Ok((StatusCode::ACCEPTED, Json(order)))
}

/// Caller balance.
async fn account_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
) -> ApiResult<Json<AccountResponse>> {
    let balance = state
        .ledger
        .balance(caller.user_id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(AccountResponse {
        user_id: caller.user_id,
        balance: balance.as_decimal(),
    }))
}

/// Caller ledger, oldest first.
async fn transactions_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
) -> ApiResult<Json<Vec<Transaction>>> {
    let transactions = state
        .store
        .accounts()
        .list_transactions(caller.user_id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(transactions))
}

/// Credit an account (admin). Only deposits and manual adjustments.
async fn credit_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CreditRequest>,
) -> ApiResult<Json<CreditResponse>> {
    caller.require_admin()?;

    let kind = match req.kind.parse::<TransactionKind>() {
        Ok(kind @ (TransactionKind::Deposit | TransactionKind::Manual)) => kind,
        _ => {
            return Err(bad_request(format!(
                "Invalid kind: {}. Expected: deposit or manual",
                req.kind
            )))
        },
    };

    let amount = Money::positive(req.amount)
        .map_err(|e| bad_request(format!("Invalid amount: {}", e)))?;

    let description = req.description.unwrap_or_else(|| format!("{} by operator", kind));

    let transaction = state
        .ledger
        .credit(user_id, amount, kind, &description, None)
        .await
        .map_err(store_error_response)?;

    Ok(Json(CreditResponse {
        user_id,
        balance: transaction.balance_after.as_decimal(),
        transaction,
    }))
}

/// Balance held with an upstream provider (admin).
async fn provider_balance_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<UpstreamBalance>> {
    caller.require_admin()?;

    let provider = state
        .store
        .catalog()
        .find_provider(id)
        .await
        .map_err(store_error_response)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("Provider not found: {}", id),
                }),
            )
        })?;

    let upstream = state.upstreams.for_provider(&provider).map_err(to_error_response)?;
    let balance = upstream.get_balance().await.map_err(to_error_response)?;

    Ok(Json(balance))
}

// =============================================================================
// Helpers
// =============================================================================

fn bad_request(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error }))
}

fn store_error_response(err: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    to_error_response(err.into())
}

/// Map an execution error to an HTTP status and JSON body.
fn to_error_response(err: ExecError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ExecError::InvalidQuantity { .. }
        | ExecError::InvalidLink(_)
        | ExecError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        ExecError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        ExecError::ServiceUnavailable(_) | ExecError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        ExecError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        ExecError::InvalidState(_) => StatusCode::CONFLICT,
        ExecError::UpstreamRejected(_) | ExecError::Provider(_) => StatusCode::BAD_GATEWAY,
        ExecError::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExecError::Domain(_) => StatusCode::BAD_REQUEST,
        ExecError::Queue(_) | ExecError::Store(_) => {
            error!(error = %err, "Request failed on infrastructure error");
            StatusCode::INTERNAL_SERVER_ERROR
        },
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use smm_domain::OrderStatus;
    use smm_exec::{MemoryQueue, StubUpstream, StubUpstreamFactory};
    use smm_store::MemoryStore;
    use smm_testkit::{fund_account, seed_catalog, Catalog};

    use crate::caller::{USER_ID_HEADER, USER_ROLE_HEADER};

    struct Fixture {
        router: Router,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        upstream: Arc<StubUpstream>,
        catalog: Catalog,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let upstream = Arc::new(StubUpstream::new());
        let factory = Arc::new(StubUpstreamFactory::new(upstream.clone()));
        let catalog = seed_catalog(store.as_ref()).await.unwrap();

        let state = Arc::new(ApiState::new(store.clone(), queue.clone(), factory));
        Fixture {
            router: create_router(state),
            store,
            queue,
            upstream,
            catalog,
        }
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        caller: Option<(Uuid, bool)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user, admin)) = caller {
            builder = builder.header(USER_ID_HEADER, user.to_string());
            if admin {
                builder = builder.header(USER_ROLE_HEADER, "admin");
            }
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn decimal(value: &Value) -> Decimal {
        value.as_str().unwrap().parse().unwrap()
    }

    fn user() -> Option<(Uuid, bool)> {
        Some((Uuid::now_v7(), false))
    }

    fn admin() -> Option<(Uuid, bool)> {
        Some((Uuid::now_v7(), true))
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture().await;
        let (status, body) = send(&f.router, Method::GET, "/health", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_place_order_charges_and_enqueues() {
        let f = fixture().await;
        let caller = user();
        let (user_id, _) = caller.unwrap();
        fund_account(f.store.as_ref(), user_id, dec!(10)).await.unwrap();

        let (status, body) = send(
            &f.router,
            Method::POST,
            "/orders",
            caller,
            Some(json!({
                "serviceId": f.catalog.service.id,
                "link": "https://instagram.com/p/abc",
                "quantity": 1000
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(f.queue.len(), 1);

        let (status, account) = send(&f.router, Method::GET, "/account", caller, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&account["balance"]), dec!(3));

        let (_, txs) = send(&f.router, Method::GET, "/account/transactions", caller, None).await;
        assert_eq!(txs.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_place_order_error_statuses() {
        let f = fixture().await;
        let caller = user();
        let (user_id, _) = caller.unwrap();
        fund_account(f.store.as_ref(), user_id, dec!(1)).await.unwrap();

        let order = |service_id: Uuid, link: &str, quantity: u32| {
            Some(json!({ "serviceId": service_id, "link": link, "quantity": quantity }))
        };
        let service = f.catalog.service.id;

        let (status, _) = send(
            &f.router,
            Method::POST,
            "/orders",
            caller,
            order(service, "https://instagram.com/p/abc", 1000),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

        let (status, _) = send(
            &f.router,
            Method::POST,
            "/orders",
            caller,
            order(service, "https://instagram.com/p/abc", 5),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            send(&f.router, Method::POST, "/orders", caller, order(service, "   ", 100)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &f.router,
            Method::POST,
            "/orders",
            caller,
            order(Uuid::now_v7(), "https://instagram.com/p/abc", 100),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("Service unavailable"));

        let (status, _) = send(
            &f.router,
            Method::POST,
            "/orders",
            None,
            order(service, "https://instagram.com/p/abc", 100),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert_eq!(f.store.order_count(), 0);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_order_visibility() {
        let f = fixture().await;
        let owner = user();
        let stranger = user();
        let (owner_id, _) = owner.unwrap();
        fund_account(f.store.as_ref(), owner_id, dec!(10)).await.unwrap();

        let (_, order) = send(
            &f.router,
            Method::POST,
            "/orders",
            owner,
            Some(json!({
                "serviceId": f.catalog.service.id,
                "link": "https://instagram.com/p/abc",
                "quantity": 100
            })),
        )
        .await;
        let uri = format!("/orders/{}", order["id"].as_str().unwrap());

        let (status, _) = send(&f.router, Method::GET, &uri, owner, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&f.router, Method::GET, &uri, stranger, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&f.router, Method::GET, &uri, admin(), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, mine) = send(&f.router, Method::GET, "/orders", owner, None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
        let (_, theirs) = send(&f.router, Method::GET, "/orders", stranger, None).await;
        assert!(theirs.as_array().unwrap().is_empty());
        let (_, all) = send(&f.router, Method::GET, "/orders", admin(), None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_refund_is_idempotent() {
        let f = fixture().await;
        let owner = user();
        let (owner_id, _) = owner.unwrap();
        fund_account(f.store.as_ref(), owner_id, dec!(10)).await.unwrap();

        let (_, order) = send(
            &f.router,
            Method::POST,
            "/orders",
            owner,
            Some(json!({
                "serviceId": f.catalog.service.id,
                "link": "https://instagram.com/p/abc",
                "quantity": 1000
            })),
        )
        .await;
        let uri = format!("/orders/{}/refund", order["id"].as_str().unwrap());

        let (status, _) = send(&f.router, Method::POST, &uri, owner, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &f.router,
            Method::POST,
            &uri,
            admin(),
            Some(json!({ "reason": "customer request" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "refunded");

        let (status, body) = send(&f.router, Method::POST, &uri, admin(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_settled");

        let (_, account) = send(&f.router, Method::GET, "/account", owner, None).await;
        assert_eq!(decimal(&account["balance"]), dec!(10));
    }

    #[tokio::test]
    async fn test_dispatch_requeues_stranded_order() {
        let f = fixture().await;
        let owner = user();
        let (owner_id, _) = owner.unwrap();
        fund_account(f.store.as_ref(), owner_id, dec!(10)).await.unwrap();
        f.queue.set_fail_enqueue(true);

        let (status, order) = send(
            &f.router,
            Method::POST,
            "/orders",
            owner,
            Some(json!({
                "serviceId": f.catalog.service.id,
                "link": "https://instagram.com/p/abc",
                "quantity": 100
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(f.queue.is_empty());

        f.queue.set_fail_enqueue(false);
        let uri = format!("/orders/{}/dispatch", order["id"].as_str().unwrap());
        let (status, body) = send(&f.router, Method::POST, &uri, admin(), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], OrderStatus::Pending.as_str());
        assert_eq!(f.queue.len(), 1);

        let missing = format!("/orders/{}/dispatch", Uuid::now_v7());
        let (status, _) = send(&f.router, Method::POST, &missing, admin(), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_credit_account() {
        let f = fixture().await;
        let target = Uuid::now_v7();
        let uri = format!("/accounts/{}/credit", target);

        let (status, body) = send(
            &f.router,
            Method::POST,
            &uri,
            admin(),
            Some(json!({ "amount": "25.50", "kind": "deposit", "description": "wire" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["balance"]), dec!(25.5));
        assert_eq!(body["transaction"]["kind"], "deposit");

        let (status, _) = send(
            &f.router,
            Method::POST,
            &uri,
            admin(),
            Some(json!({ "amount": "5", "kind": "refund" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &f.router,
            Method::POST,
            &uri,
            admin(),
            Some(json!({ "amount": "0", "kind": "manual" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &f.router,
            Method::POST,
            &uri,
            user(),
            Some(json!({ "amount": "5", "kind": "manual" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_provider_balance() {
        let f = fixture().await;
        f.upstream.set_balance(dec!(42.5));

        let uri = format!("/providers/{}/balance", f.catalog.provider.id);
        let (status, body) = send(&f.router, Method::GET, &uri, admin(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["balance"]), dec!(42.5));

        let missing = format!("/providers/{}/balance", Uuid::now_v7());
        let (status, _) = send(&f.router, Method::GET, &missing, admin(), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
