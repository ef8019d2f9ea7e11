//! SMM Execution Layer
//!
//! Turns engine decisions into side effects: ledger postings, guarded order
//! transitions, upstream calls and queue operations.
//!
//! # Architecture
//!
//! ```text
//! placeOrder → [debit + order] → DispatchQueue → FulfillmentWorker → Upstream
//!                                                      │
//!                       Reconciler ◄── getStatus ──────┘
//!                           │
//!                       RefundPath (idempotent credit)
//! ```
//!
//! # Components
//!
//! - **Ports**: `UpstreamPort`, `UpstreamFactory` and `DispatchQueue`
//! - **Placement**: synchronous order intake
//! - **Worker**: at-least-once dispatch with retry and refund
//! - **Reconciler**: status polling and the stranded-order sweep
//! - **Refund**: the only path that returns a charge
//! - **Rate sync**: keeps selling prices in line with provider rates
//! - **Stub / MemoryQueue**: test implementations
//!
//! # Example
//!
//! ```rust,ignore
//! use smm_exec::{FulfillmentWorker, MemoryQueue, OrderPlacementService, PlaceOrder};
//! use smm_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let queue = Arc::new(MemoryQueue::new());
//! let placement = OrderPlacementService::new(store.clone(), queue.clone());
//!
//! let order = placement.place_order(request).await?;
//! worker.poll_once().await?;
//! ```

#![warn(clippy::all)]

pub mod error;
#[cfg(feature = "postgres")]
pub mod pg_queue;
pub mod placement;
pub mod ports;
pub mod queue;
pub mod rate_sync;
pub mod reconciliation;
pub mod refund;
pub mod stub;
pub mod worker;

// Re-exports for convenience
pub use error::{ExecError, ExecResult};
#[cfg(feature = "postgres")]
pub use pg_queue::PgQueue;
pub use placement::{OrderPlacementService, OrderScope, PlaceOrder};
pub use ports::{
    CreateOrderRequest, Delivery, DispatchQueue, UpstreamBalance, UpstreamFactory, UpstreamPort,
    UpstreamService,
};
pub use queue::MemoryQueue;
pub use rate_sync::{RateSync, RateSyncReport};
pub use reconciliation::{ReconcileReport, Reconciler};
pub use refund::{RefundOutcome, RefundPath};
pub use stub::{StubResponse, StubUpstream, StubUpstreamFactory};
pub use worker::{FulfillmentWorker, JobOutcome};
