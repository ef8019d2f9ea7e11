//! Refund path.
//!
//! Idempotent: the status guard is re-checked inside the unit of work, so a
//! redelivered job, a concurrent reconciliation and an admin trigger can all
//! race on the same order and exactly one credit lands.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use smm_domain::{Money, Order, OrderId, OrderStatus, Transaction, TransactionKind};
use smm_store::{OrderPatch, Store, UnitOfWork};

use crate::error::{ExecError, ExecResult};

/// Guard conflicts tolerated before giving up
const MAX_GUARD_RETRIES: usize = 3;

/// Result of a refund request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    /// Order moved to `refunded`
    Refunded {
        /// Order after the refund
        order: Order,
        /// Amount credited back (zero if a partial credit already covered it)
        credited: Money,
        /// The refund ledger entry, absent when nothing was credited
        transaction: Option<Transaction>,
    },
    /// Order was already refunded or cancelled; nothing changed
    AlreadySettled {
        /// Status found
        status: OrderStatus,
    },
}

impl RefundOutcome {
    /// True if this call performed the refund
    pub fn is_refunded(&self) -> bool {
        matches!(self, Self::Refunded { .. })
    }
}

/// Restores charged funds and marks orders refunded.
#[derive(Clone)]
pub struct RefundPath {
    store: Arc<dyn Store>,
}

impl RefundPath {
    /// Create a refund path over a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Refund the outstanding part of an order's charge.
    ///
    /// Any status other than refunded or cancelled is credited, including
    /// completed orders.
    ///
    /// # Errors
    /// - `OrderNotFound` for an unknown id
    pub async fn refund_order(&self, order_id: OrderId, reason: &str) -> ExecResult<RefundOutcome> {
        for _ in 0..MAX_GUARD_RETRIES {
            let order = self
                .store
                .orders()
                .find_by_id(order_id)
                .await?
                .ok_or(ExecError::OrderNotFound(order_id))?;

            if order.is_settled() {
                info!(%order_id, status = %order.status, "Refund skipped, order already settled");
                return Ok(RefundOutcome::AlreadySettled {
                    status: order.status,
                });
            }

            let outstanding = order.outstanding_charge();
            let mut patch = OrderPatch::default().release_lease();
            if !outstanding.is_zero() {
                patch = patch.refund(outstanding);
            }
            let mut uow =
                UnitOfWork::new().transition(order.id, &[order.status], OrderStatus::Refunded, patch);
            if !outstanding.is_zero() {
                uow = uow.credit(
                    order.user_id,
                    outstanding,
                    TransactionKind::Refund,
                    format!("refund for order {}: {}", order.id, reason),
                    Some(order.id),
                );
            }

            match self.store.commit(uow).await {
                Ok(mut receipt) => {
                    let refunded = receipt
                        .order(order.id)
                        .cloned()
                        .ok_or_else(|| ExecError::InvalidState("refund wrote no order".to_string()))?;
                    let transaction = receipt.transactions.pop();
                    info!(
                        %order_id,
                        user_id = %order.user_id,
                        credited = %outstanding,
                        reason,
                        "Order refunded"
                    );
                    return Ok(RefundOutcome::Refunded {
                        order: refunded,
                        credited: outstanding,
                        transaction,
                    });
                },
                Err(e) if e.is_stale() => {
                    warn!(%order_id, error = %e, "Order changed during refund, re-reading");
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecError::InvalidState(format!(
            "order {} kept changing during refund",
            order_id
        )))
    }
}
