//! Fulfillment worker.
//!
//! Consumes dispatch jobs, submits them upstream and moves the order forward.
//!
//! # Flow
//!
//! ```text
//! reserve → claim lease → createOrder → decide_dispatch
//!                                         ├─ MarkProcessing → guarded pending→processing
//!                                         ├─ Refund         → RefundPath
//!                                         └─ Retry          → release with backoff
//! ```
//!
//! Delivery is at-least-once. The lease claim turns duplicates into no-ops
//! and the guarded transitions make a redelivered job harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use smm_domain::{Order, OrderId, OrderStatus, ProviderStatus};
use smm_engine::{decide_dispatch, CreateAttempt, DispatchDecision, RetryPolicy};
use smm_store::{ClaimOutcome, OrderPatch, Store, StoreError, UnitOfWork};

use crate::error::{ExecError, ExecResult};
use crate::ports::{CreateOrderRequest, Delivery, DispatchQueue, UpstreamFactory, UpstreamPort};
use crate::refund::{RefundOutcome, RefundPath};

// =============================================================================
// Job Outcome
// =============================================================================

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Accepted upstream; order is `processing`
    Dispatched {
        /// Order
        order_id: OrderId,
        /// Provider-side order id
        upstream_order_id: String,
    },
    /// Charge returned; order is `refunded`
    Refunded {
        /// Order
        order_id: OrderId,
        /// Refund reason
        reason: String,
    },
    /// Put back on the queue
    RetryScheduled {
        /// Order
        order_id: OrderId,
        /// Attempt that failed
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Nothing to do (duplicate, already settled, missing order)
    Skipped {
        /// Order
        order_id: OrderId,
        /// Why the job was dropped
        reason: String,
    },
}

// =============================================================================
// Worker
// =============================================================================

/// One dispatch consumer. Cheap to clone; the daemon runs several.
#[derive(Clone)]
pub struct FulfillmentWorker {
    store: Arc<dyn Store>,
    queue: Arc<dyn DispatchQueue>,
    upstreams: Arc<dyn UpstreamFactory>,
    refunds: RefundPath,
    policy: RetryPolicy,
    lease: chrono::Duration,
}

impl FulfillmentWorker {
    /// Create a worker.
    ///
    /// `lease` bounds how long a claimed order is protected from other
    /// consumers; it should exceed the upstream timeout.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn DispatchQueue>,
        upstreams: Arc<dyn UpstreamFactory>,
        policy: RetryPolicy,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            refunds: RefundPath::new(store.clone()),
            store,
            queue,
            upstreams,
            policy,
            lease,
        }
    }

    /// Reserve and process the next visible job, if any.
    pub async fn poll_once(&self) -> ExecResult<Option<JobOutcome>> {
        let Some(delivery) = self.queue.reserve().await? else {
            return Ok(None);
        };
        debug!(
            delivery_id = %delivery.id,
            order_id = %delivery.job.order_id,
            attempt = delivery.attempt,
            "Dispatch job reserved"
        );
        self.process(&delivery).await.map(Some)
    }

    /// Process one reserved job. Always settles the delivery (ack, release
    /// or bury) unless the queue itself fails.
    pub async fn process(&self, delivery: &Delivery) -> ExecResult<JobOutcome> {
        let order_id = delivery.job.order_id;
        let now = Utc::now();

        let order = match self
            .store
            .orders()
            .claim_dispatch(order_id, now + self.lease, now)
            .await
        {
            Ok(ClaimOutcome::Claimed(order)) => order,
            Ok(ClaimOutcome::NotPending(status)) => {
                return self.skip(delivery, format!("order is already {}", status)).await;
            },
            Ok(ClaimOutcome::Leased { until }) => {
                return self.skip(delivery, format!("dispatch lease held until {}", until)).await;
            },
            Err(StoreError::NotFound { .. }) => {
                warn!(%order_id, "Dispatch job for unknown order, burying");
                self.queue.bury(delivery, "order not found").await?;
                return Ok(JobOutcome::Skipped {
                    order_id,
                    reason: "order not found".to_string(),
                });
            },
            Err(e) => return self.retry_later(delivery, &e.to_string()).await,
        };

        let upstream = match self.upstream_for(&order).await {
            Ok(upstream) => upstream,
            Err(ExecError::Provider(message)) => {
                return self
                    .refund(delivery, format!("provider unavailable: {}", message))
                    .await;
            },
            Err(e) => return self.retry_later(delivery, &e.to_string()).await,
        };

        let attempt = match upstream.create_order(&CreateOrderRequest::from(&delivery.job)).await {
            Ok(upstream_order_id) => CreateAttempt::Accepted { upstream_order_id },
            Err(ExecError::UpstreamRejected(message)) => CreateAttempt::Rejected { message },
            Err(e) if e.is_transient() => CreateAttempt::Unavailable {
                error: e.to_string(),
            },
            Err(e) => CreateAttempt::Rejected {
                message: e.to_string(),
            },
        };

        if let CreateAttempt::Unavailable { error } = &attempt {
            warn!(%order_id, attempt = delivery.attempt, %error, "Upstream unavailable");
        }

        match decide_dispatch(attempt, delivery.attempt, &self.policy) {
            DispatchDecision::MarkProcessing { upstream_order_id } => {
                self.mark_processing(delivery, &order, upstream_order_id, upstream.as_ref())
                    .await
            },
            DispatchDecision::Refund { reason } => self.refund(delivery, reason).await,
            DispatchDecision::Retry { delay } => {
                self.release_lease(order_id).await;
                self.queue.release(delivery, delay).await?;
                warn!(
                    %order_id,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Dispatch retry scheduled"
                );
                Ok(JobOutcome::RetryScheduled {
                    order_id,
                    attempt: delivery.attempt,
                    delay,
                })
            },
        }
    }

    async fn upstream_for(&self, order: &Order) -> ExecResult<Arc<dyn UpstreamPort>> {
        let provider = self
            .store
            .catalog()
            .find_provider(order.provider_id)
            .await?
            .ok_or_else(|| ExecError::Provider(format!("provider {} not found", order.provider_id)))?;

        if provider.status != ProviderStatus::Active {
            return Err(ExecError::Provider(format!("provider {} is disabled", provider.name)));
        }
        self.upstreams.for_provider(&provider)
    }

    async fn mark_processing(
        &self,
        delivery: &Delivery,
        order: &Order,
        upstream_order_id: String,
        upstream: &dyn UpstreamPort,
    ) -> ExecResult<JobOutcome> {
        let uow = UnitOfWork::new().transition(
            order.id,
            &[OrderStatus::Pending],
            OrderStatus::Processing,
            OrderPatch::dispatched(upstream_order_id.clone()),
        );

        match self.store.commit(uow).await {
            Ok(_) => {
                self.queue.ack(delivery).await?;
                info!(
                    order_id = %order.id,
                    upstream_order_id = %upstream_order_id,
                    "Order dispatched, status processing"
                );
                Ok(JobOutcome::Dispatched {
                    order_id: order.id,
                    upstream_order_id,
                })
            },
            Err(e) if e.is_stale() => {
                // Settled while the call was in flight; the charge is already back.
                warn!(
                    order_id = %order.id,
                    upstream_order_id = %upstream_order_id,
                    error = %e,
                    "Order settled during dispatch, cancelling upstream"
                );
                if let Err(cancel_err) = upstream.cancel_order(&upstream_order_id).await {
                    warn!(
                        order_id = %order.id,
                        upstream_order_id = %upstream_order_id,
                        error = %cancel_err,
                        "Upstream cancel failed"
                    );
                }
                self.skip(delivery, "order settled during dispatch".to_string()).await
            },
            Err(e) => {
                // Redelivering would submit a second upstream order.
                error!(
                    order_id = %order.id,
                    upstream_order_id = %upstream_order_id,
                    error = %e,
                    "Accepted upstream but failed to record dispatch"
                );
                self.hand_over_to_reconciliation(order.id, &upstream_order_id).await;
                self.queue
                    .bury(
                        delivery,
                        &format!("accepted upstream as {} but not recorded: {}", upstream_order_id, e),
                    )
                    .await?;
                Err(e.into())
            },
        }
    }

    /// Keep the upstream id on the pending order so the stranded sweep never
    /// submits it again. If this write fails too, only the lease protects it.
    async fn hand_over_to_reconciliation(&self, order_id: OrderId, upstream_order_id: &str) {
        match self
            .store
            .orders()
            .record_upstream_order(order_id, upstream_order_id)
            .await
        {
            Ok(true) => {
                warn!(%order_id, upstream_order_id, "Upstream id kept on pending order for reconciliation");
            },
            Ok(false) => {
                warn!(%order_id, upstream_order_id, "Order no longer pending, upstream id not kept");
            },
            Err(e) => {
                error!(
                    %order_id,
                    upstream_order_id,
                    error = %e,
                    "Failed to keep upstream id, order may be dispatched again after its lease"
                );
            },
        }
    }

    async fn refund(&self, delivery: &Delivery, reason: String) -> ExecResult<JobOutcome> {
        let order_id = delivery.job.order_id;
        match self.refunds.refund_order(order_id, &reason).await {
            Ok(RefundOutcome::Refunded { .. }) => {
                self.queue.ack(delivery).await?;
                Ok(JobOutcome::Refunded { order_id, reason })
            },
            Ok(RefundOutcome::AlreadySettled { status }) => {
                self.skip(delivery, format!("order is already {}", status)).await
            },
            Err(e) => {
                error!(%order_id, error = %e, "Refund after failed dispatch did not commit");
                self.retry_later(delivery, &e.to_string()).await
            },
        }
    }

    async fn skip(&self, delivery: &Delivery, reason: String) -> ExecResult<JobOutcome> {
        let order_id = delivery.job.order_id;
        self.queue.ack(delivery).await?;
        debug!(%order_id, %reason, "Dispatch job skipped");
        Ok(JobOutcome::Skipped { order_id, reason })
    }

    /// Infrastructure failure: back off, or bury once attempts run out. A
    /// buried order stays `pending` and the reconciliation sweep picks it up.
    async fn retry_later(&self, delivery: &Delivery, error: &str) -> ExecResult<JobOutcome> {
        let order_id = delivery.job.order_id;
        self.release_lease(order_id).await;

        if self.policy.is_exhausted(delivery.attempt) {
            error!(%order_id, attempt = delivery.attempt, %error, "Dispatch job failed, burying");
            self.queue.bury(delivery, error).await?;
            return Ok(JobOutcome::Skipped {
                order_id,
                reason: error.to_string(),
            });
        }

        let delay = self.policy.delay_for(delivery.attempt);
        warn!(%order_id, attempt = delivery.attempt, %error, "Dispatch job failed, retrying");
        self.queue.release(delivery, delay).await?;
        Ok(JobOutcome::RetryScheduled {
            order_id,
            attempt: delivery.attempt,
            delay,
        })
    }

    async fn release_lease(&self, order_id: OrderId) {
        if let Err(e) = self.store.orders().release_dispatch(order_id).await {
            warn!(%order_id, error = %e, "Failed to release dispatch lease");
        }
    }
}
