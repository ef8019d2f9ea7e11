//! Stub implementations for testing.
//!
//! These implementations simulate provider behavior without making real
//! API calls. Responses to `create_order` are scripted per call; statuses
//! are set per upstream order id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;

use smm_domain::{Provider, ProviderId, StatusReport, UpstreamStatus};

use crate::error::{ExecError, ExecResult};
use crate::ports::{
    CreateOrderRequest, UpstreamBalance, UpstreamFactory, UpstreamPort, UpstreamService,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Stub Upstream
// =============================================================================

/// Scripted answer to one `create_order` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubResponse {
    /// Accept with a generated order id
    Accept,
    /// Explicit `{error}` answer
    Reject(String),
    /// Timeout / transport failure
    Unavailable,
}

/// Stub provider for testing.
///
/// Accepts every order unless responses were scripted with
/// [`StubUpstream::push_create`].
pub struct StubUpstream {
    create_script: Mutex<VecDeque<StubResponse>>,
    statuses: Mutex<HashMap<String, StatusReport>>,
    failing_status: Mutex<HashSet<String>>,
    services: Mutex<Vec<UpstreamService>>,
    balance: Mutex<Decimal>,
    created: Mutex<Vec<CreateOrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    order_counter: AtomicU64,
    status_calls: AtomicU64,
}

impl StubUpstream {
    /// Create a stub with an empty catalog and a zero balance.
    pub fn new() -> Self {
        Self {
            create_script: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            failing_status: Mutex::new(HashSet::new()),
            services: Mutex::new(Vec::new()),
            balance: Mutex::new(Decimal::ZERO),
            created: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            order_counter: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
        }
    }

    /// Queue the answer for the next `create_order` call.
    pub fn push_create(&self, response: StubResponse) {
        guard(&self.create_script).push_back(response);
    }

    /// Set the status returned for an upstream order id.
    pub fn set_status(&self, upstream_order_id: &str, status: UpstreamStatus, start_count: u64, remains: u64) {
        guard(&self.statuses).insert(
            upstream_order_id.to_string(),
            StatusReport {
                status,
                start_count,
                remains,
            },
        );
    }

    /// Make `get_status` fail transiently for an upstream order id.
    pub fn fail_status(&self, upstream_order_id: &str) {
        guard(&self.failing_status).insert(upstream_order_id.to_string());
    }

    /// Replace the catalog returned by `get_services`.
    pub fn set_services(&self, services: Vec<UpstreamService>) {
        *guard(&self.services) = services;
    }

    /// Set the balance returned by `get_balance`.
    pub fn set_balance(&self, balance: Decimal) {
        *guard(&self.balance) = balance;
    }

    /// Requests accepted by `create_order`, in order.
    pub fn created(&self) -> Vec<CreateOrderRequest> {
        guard(&self.created).clone()
    }

    /// Number of `create_order` calls, accepted or not.
    pub fn create_calls(&self) -> u64 {
        self.order_counter.load(Ordering::SeqCst)
    }

    /// Number of `get_status` calls.
    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Upstream ids passed to `cancel_order`.
    pub fn cancelled(&self) -> Vec<String> {
        guard(&self.cancelled).clone()
    }
}

impl Default for StubUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamPort for StubUpstream {
    async fn create_order(&self, request: &CreateOrderRequest) -> ExecResult<String> {
        let call = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let response = guard(&self.create_script).pop_front().unwrap_or(StubResponse::Accept);

        match response {
            StubResponse::Accept => {
                let id = format!("STUB-{}", call);
                guard(&self.created).push(request.clone());
                guard(&self.statuses).insert(
                    id.clone(),
                    StatusReport {
                        status: UpstreamStatus::Pending,
                        start_count: 0,
                        remains: u64::from(request.quantity),
                    },
                );
                tracing::debug!(upstream_order_id = %id, "Stub: order accepted");
                Ok(id)
            },
            StubResponse::Reject(message) => Err(ExecError::UpstreamRejected(message)),
            StubResponse::Unavailable => {
                Err(ExecError::UpstreamTransient("Simulated upstream timeout".to_string()))
            },
        }
    }

    async fn get_status(&self, upstream_order_id: &str) -> ExecResult<StatusReport> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if guard(&self.failing_status).contains(upstream_order_id) {
            return Err(ExecError::UpstreamTransient(
                "Simulated status fetch failure".to_string(),
            ));
        }
        guard(&self.statuses)
            .get(upstream_order_id)
            .cloned()
            .ok_or_else(|| ExecError::UpstreamRejected("Incorrect order ID".to_string()))
    }

    async fn get_balance(&self) -> ExecResult<UpstreamBalance> {
        Ok(UpstreamBalance {
            balance: *guard(&self.balance),
            currency: "USD".to_string(),
        })
    }

    async fn get_services(&self) -> ExecResult<Vec<UpstreamService>> {
        Ok(guard(&self.services).clone())
    }

    async fn cancel_order(&self, upstream_order_id: &str) -> ExecResult<bool> {
        guard(&self.cancelled).push(upstream_order_id.to_string());
        Ok(true)
    }
}

// =============================================================================
// Stub Factory
// =============================================================================

/// Factory handing out one shared [`StubUpstream`] for every provider.
pub struct StubUpstreamFactory {
    upstream: Arc<StubUpstream>,
    broken: Mutex<HashSet<ProviderId>>,
}

impl StubUpstreamFactory {
    /// Wrap a stub upstream.
    pub fn new(upstream: Arc<StubUpstream>) -> Self {
        Self {
            upstream,
            broken: Mutex::new(HashSet::new()),
        }
    }

    /// The shared stub.
    pub fn upstream(&self) -> Arc<StubUpstream> {
        self.upstream.clone()
    }

    /// Make adapter construction fail for a provider (bad key, unknown kind).
    pub fn break_provider(&self, provider_id: ProviderId) {
        guard(&self.broken).insert(provider_id);
    }
}

impl UpstreamFactory for StubUpstreamFactory {
    fn for_provider(&self, provider: &Provider) -> ExecResult<Arc<dyn UpstreamPort>> {
        if guard(&self.broken).contains(&provider.id) {
            return Err(ExecError::Provider(format!(
                "cannot build adapter for provider {}",
                provider.name
            )));
        }
        Ok(self.upstream.clone())
    }
}
