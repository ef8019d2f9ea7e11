//! SMM Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//! Takes the outcome of an upstream call plus the current order and returns
//! the action the executor has to carry out.

#![warn(clippy::all)]

pub mod dispatch;
pub mod reconcile;
pub mod retry;

pub use dispatch::{decide_dispatch, CreateAttempt, DispatchDecision};
pub use reconcile::{decide_reconciliation, is_stranded, partial_refund_amount, ReconcileAction};
pub use retry::RetryPolicy;

/// Refund reason used when the provider cancels an order
pub const REASON_CANCELLED_UPSTREAM: &str = "cancelled upstream";
