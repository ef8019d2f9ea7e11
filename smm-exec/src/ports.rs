//! Execution layer port definitions.
//!
//! Ports define the interfaces for external services (upstream providers,
//! the dispatch queue). Adapters implement these ports for specific
//! backends (standard SMM panel API, PostgreSQL queue, stubs).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smm_domain::{DispatchJob, Link, Provider, ServiceRef, StatusReport};

use crate::error::ExecResult;

// =============================================================================
// Upstream Port
// =============================================================================

/// Port for one upstream fulfillment provider.
///
/// Implementations:
/// - `StubUpstream` - For testing (scripted responses)
/// - `StandardSmmClient` - Classic `action=...` panel API (smm-connectors)
///
/// Explicit `{error}` answers surface as `ExecError::UpstreamRejected`;
/// timeouts and transport failures as `ExecError::UpstreamTransient`.
#[async_trait]
pub trait UpstreamPort: Send + Sync {
    /// Submit an order, returning the provider's order id.
    async fn create_order(&self, request: &CreateOrderRequest) -> ExecResult<String>;

    /// Current status of a provider order.
    async fn get_status(&self, upstream_order_id: &str) -> ExecResult<StatusReport>;

    /// Account balance held with the provider.
    async fn get_balance(&self) -> ExecResult<UpstreamBalance>;

    /// Provider service catalog.
    async fn get_services(&self) -> ExecResult<Vec<UpstreamService>>;

    /// Ask the provider to cancel an order. Returns whether it accepted.
    async fn cancel_order(&self, upstream_order_id: &str) -> ExecResult<bool>;
}

/// Builds the adapter for a provider from its `kind`.
///
/// The provider key is decrypted here and nowhere else.
pub trait UpstreamFactory: Send + Sync {
    /// Adapter for `provider`.
    fn for_provider(&self, provider: &Provider) -> ExecResult<Arc<dyn UpstreamPort>>;
}

/// Provider-agnostic order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Upstream service reference
    pub service_ref: ServiceRef,
    /// Destination link
    pub link: Link,
    /// Units to deliver
    pub quantity: u32,
}

impl From<&DispatchJob> for CreateOrderRequest {
    fn from(job: &DispatchJob) -> Self {
        Self {
            service_ref: job.service_ref.clone(),
            link: job.link.clone(),
            quantity: job.quantity,
        }
    }
}

/// Balance reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamBalance {
    /// Amount available
    pub balance: Decimal,
    /// Currency code as reported
    pub currency: String,
}

/// One entry of a provider catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamService {
    /// Provider-side service id
    pub service: String,
    /// Display name
    pub name: String,
    /// Cost per 1000 units
    pub rate: Decimal,
    /// Minimum order
    pub min: u32,
    /// Maximum order
    pub max: u32,
    /// Service type ("Default", "Custom Comments"...)
    pub kind: Option<String>,
    /// Catalog category
    pub category: Option<String>,
}

// =============================================================================
// Dispatch Queue Port
// =============================================================================

/// Durable at-least-once queue of dispatch jobs.
///
/// Implementations:
/// - `MemoryQueue` - For testing and single-process development
/// - `PgQueue` - `dispatch_jobs` table (feature `postgres`)
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Add a job, visible immediately.
    async fn enqueue(&self, job: DispatchJob) -> ExecResult<()>;

    /// Take the next visible job, incrementing its attempt counter.
    async fn reserve(&self) -> ExecResult<Option<Delivery>>;

    /// Remove a finished job.
    async fn ack(&self, delivery: &Delivery) -> ExecResult<()>;

    /// Return a job to the queue, visible again after `delay`.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> ExecResult<()>;

    /// Park a job that can never succeed.
    async fn bury(&self, delivery: &Delivery, reason: &str) -> ExecResult<()>;
}

/// A reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue entry id
    pub id: Uuid,
    /// Payload
    pub job: DispatchJob,
    /// 1-based delivery attempt
    pub attempt: u32,
}
