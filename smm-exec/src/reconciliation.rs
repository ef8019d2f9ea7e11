//! Reconciliation job.
//!
//! One pass polls the provider for every in-flight order, applies the
//! mapped action through guarded transitions, then sweeps `pending` orders
//! that never got a dispatch job.
//!
//! A pass is safe to run twice: every write is guarded on the status read at
//! the start of the pass, and refunds go through the idempotent refund path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use smm_domain::{Order, OrderStatus, ProviderId, ProviderStatus, TransactionKind};
use smm_engine::{decide_reconciliation, is_stranded, ReconcileAction};
use smm_store::{OrderPatch, Store, UnitOfWork};

use crate::error::{ExecError, ExecResult};
use crate::ports::{DispatchQueue, UpstreamFactory, UpstreamPort};
use crate::refund::{RefundOutcome, RefundPath};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// In-flight orders looked at
    pub checked: usize,
    /// Nothing to write (or lost a race)
    pub unchanged: usize,
    /// Progress numbers persisted
    pub progressed: usize,
    /// Moved to `completed`
    pub completed: usize,
    /// Moved to `partial`
    pub partial: usize,
    /// Refunded after an upstream cancel
    pub refunded: usize,
    /// Status could not be fetched or applied
    pub failed: usize,
    /// Stranded pending orders re-enqueued
    pub requeued: usize,
}

enum Applied {
    Unchanged,
    Progressed,
    Completed,
    Partial,
    Refunded,
}

/// Periodic status poller.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    queue: Arc<dyn DispatchQueue>,
    upstreams: Arc<dyn UpstreamFactory>,
    refunds: RefundPath,
    stale_after: chrono::Duration,
}

impl Reconciler {
    /// Create a reconciler. Pending orders older than `stale_after` without a
    /// dispatch are re-enqueued.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn DispatchQueue>,
        upstreams: Arc<dyn UpstreamFactory>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            refunds: RefundPath::new(store.clone()),
            store,
            queue,
            upstreams,
            stale_after,
        }
    }

    /// Run one full pass.
    pub async fn run_once(&self) -> ExecResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let orders = self.store.orders().find_reconcilable().await?;
        let mut adapters: HashMap<ProviderId, Option<Arc<dyn UpstreamPort>>> = HashMap::new();

        for order in &orders {
            report.checked += 1;

            if !adapters.contains_key(&order.provider_id) {
                let adapter = self.adapter_for(order.provider_id).await;
                adapters.insert(order.provider_id, adapter);
            }
            let Some(upstream) = adapters.get(&order.provider_id).cloned().flatten() else {
                report.failed += 1;
                continue;
            };

            match self.reconcile_order(order, upstream.as_ref()).await {
                Ok(Applied::Unchanged) => report.unchanged += 1,
                Ok(Applied::Progressed) => report.progressed += 1,
                Ok(Applied::Completed) => report.completed += 1,
                Ok(Applied::Partial) => report.partial += 1,
                Ok(Applied::Refunded) => report.refunded += 1,
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Reconciliation failed for order");
                    report.failed += 1;
                },
            }
        }

        report.requeued = self.sweep_stranded().await?;

        if report.checked > 0 || report.requeued > 0 {
            info!(
                checked = report.checked,
                progressed = report.progressed,
                completed = report.completed,
                partial = report.partial,
                refunded = report.refunded,
                failed = report.failed,
                requeued = report.requeued,
                "Reconciliation pass finished"
            );
        } else {
            debug!("Reconciliation pass found nothing to do");
        }
        Ok(report)
    }

    async fn adapter_for(&self, provider_id: ProviderId) -> Option<Arc<dyn UpstreamPort>> {
        let provider = match self.store.catalog().find_provider(provider_id).await {
            Ok(Some(provider)) if provider.status == ProviderStatus::Active => provider,
            Ok(Some(_)) => {
                warn!(%provider_id, "Provider disabled, its orders are not reconciled");
                return None;
            },
            Ok(None) => {
                warn!(%provider_id, "Provider not found, its orders are not reconciled");
                return None;
            },
            Err(e) => {
                warn!(%provider_id, error = %e, "Provider lookup failed");
                return None;
            },
        };

        match self.upstreams.for_provider(&provider) {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                warn!(%provider_id, error = %e, "Cannot build provider adapter");
                None
            },
        }
    }

    async fn reconcile_order(&self, order: &Order, upstream: &dyn UpstreamPort) -> ExecResult<Applied> {
        let Some(upstream_order_id) = order.upstream_order_id.as_deref() else {
            return Ok(Applied::Unchanged);
        };

        let report = match upstream.get_status(upstream_order_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    event = "ReconciliationFetchFailed",
                    order_id = %order.id,
                    upstream_order_id,
                    error = %e,
                    "Upstream status fetch failed"
                );
                return Err(e);
            },
        };

        match decide_reconciliation(order, &report) {
            ReconcileAction::NoChange | ReconcileAction::NotReconcilable => Ok(Applied::Unchanged),
            ReconcileAction::Unrecognized(raw) => {
                warn!(order_id = %order.id, status = %raw, "Unrecognized upstream status, skipping");
                Ok(Applied::Unchanged)
            },
            ReconcileAction::Progress {
                start_count,
                remains,
            } => {
                let uow = UnitOfWork::new().transition(
                    order.id,
                    &[order.status],
                    OrderStatus::Processing,
                    OrderPatch::default().progress(start_count, remains),
                );
                self.apply(order, uow, OrderStatus::Processing, Applied::Progressed).await
            },
            ReconcileAction::Complete {
                start_count,
                remains,
            } => {
                let uow = UnitOfWork::new().transition(
                    order.id,
                    &[order.status],
                    OrderStatus::Completed,
                    OrderPatch::default().progress(start_count, remains),
                );
                self.apply(order, uow, OrderStatus::Completed, Applied::Completed).await
            },
            ReconcileAction::Partial {
                start_count,
                remains,
                refund,
            } => {
                let mut patch = OrderPatch::default().progress(start_count, remains);
                if !refund.is_zero() {
                    patch = patch.refund(refund);
                }
                let mut uow =
                    UnitOfWork::new().transition(order.id, &[order.status], OrderStatus::Partial, patch);
                if !refund.is_zero() {
                    uow = uow.credit(
                        order.user_id,
                        refund,
                        TransactionKind::Refund,
                        format!(
                            "partial refund for order {}: {} of {} undelivered",
                            order.id, remains, order.quantity
                        ),
                        Some(order.id),
                    );
                }
                self.apply(order, uow, OrderStatus::Partial, Applied::Partial).await
            },
            ReconcileAction::Refund { reason } => {
                match self.refunds.refund_order(order.id, &reason).await? {
                    RefundOutcome::Refunded { .. } => Ok(Applied::Refunded),
                    RefundOutcome::AlreadySettled { .. } => Ok(Applied::Unchanged),
                }
            },
        }
    }

    async fn apply(
        &self,
        order: &Order,
        uow: UnitOfWork,
        to: OrderStatus,
        applied: Applied,
    ) -> ExecResult<Applied> {
        match self.store.commit(uow).await {
            Ok(_) => {
                if to != order.status {
                    info!(order_id = %order.id, from = %order.status, to = %to, "Order status updated");
                }
                Ok(applied)
            },
            Err(e) if e.is_stale() => {
                warn!(order_id = %order.id, error = %e, "Order changed during reconciliation, skipping");
                Ok(Applied::Unchanged)
            },
            Err(e) => Err(ExecError::from(e)),
        }
    }

    async fn sweep_stranded(&self) -> ExecResult<usize> {
        let now = Utc::now();
        let stranded: Vec<Order> = self
            .store
            .orders()
            .find_undispatched()
            .await?
            .into_iter()
            .filter(|order| is_stranded(order, now, self.stale_after))
            .collect();

        let mut requeued = 0;
        for order in stranded {
            match self.queue.enqueue(order.dispatch_job()).await {
                Ok(()) => {
                    info!(order_id = %order.id, "Stranded pending order re-enqueued");
                    requeued += 1;
                },
                Err(e) => warn!(order_id = %order.id, error = %e, "Re-enqueue of stranded order failed"),
            }
        }
        Ok(requeued)
    }
}
