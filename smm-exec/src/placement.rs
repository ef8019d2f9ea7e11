//! Order placement service.
//!
//! # Flow
//!
//! ```text
//! validate → [debit + insert order + order transaction] → enqueue dispatch job
//!            └──────────── one unit of work ───────────┘
//! ```
//!
//! Everything before the commit fails without side effects. The enqueue runs
//! only after the commit; if it fails the order stays `pending` and the
//! reconciliation sweep dispatches it later.

use std::sync::Arc;

use tracing::{info, warn};

use smm_domain::{Link, Order, OrderId, OrderStatus, ServiceId, TransactionKind, UserId};
use smm_store::{Store, UnitOfWork};

use crate::error::{ExecError, ExecResult};
use crate::ports::DispatchQueue;

/// Purchase request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    /// Buyer (and account debited)
    pub user_id: UserId,
    /// Catalog entry
    pub service_id: ServiceId,
    /// Raw destination link, trimmed and validated here
    pub link: String,
    /// Units to buy
    pub quantity: u32,
}

/// Which orders a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    /// Orders of one user
    User(UserId),
    /// Every order (administrators)
    All,
}

/// Orchestrates ledger, order store and dispatch queue.
#[derive(Clone)]
pub struct OrderPlacementService {
    store: Arc<dyn Store>,
    queue: Arc<dyn DispatchQueue>,
}

impl OrderPlacementService {
    /// Create a placement service.
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn DispatchQueue>) -> Self {
        Self { store, queue }
    }

    /// Charge the user and create a pending order.
    ///
    /// # Errors
    /// `ServiceUnavailable`, `InvalidQuantity`, `InvalidLink` or
    /// `InsufficientFunds`; none of them leave anything behind.
    pub async fn place_order(&self, request: PlaceOrder) -> ExecResult<Order> {
        let service = self
            .store
            .catalog()
            .find_service(request.service_id)
            .await?
            .filter(|s| s.is_active())
            .ok_or_else(|| {
                ExecError::ServiceUnavailable(format!(
                    "service {} not found or inactive",
                    request.service_id
                ))
            })?;

        service.validate_quantity(request.quantity)?;
        let link = Link::parse(&request.link)?;

        let order = Order::new_pending(request.user_id, &service, link, request.quantity)?;
        if order.charge.is_zero() {
            return Err(ExecError::InvalidAmount(format!(
                "charge for {} units of {} rounds to zero",
                request.quantity, service.name
            )));
        }

        let uow = UnitOfWork::new()
            .debit(
                order.user_id,
                order.charge,
                TransactionKind::Order,
                format!("order {} for {}", order.id, service.name),
                Some(order.id),
            )
            .insert_order(order.clone());
        self.store.commit(uow).await?;

        info!(
            order_id = %order.id,
            user_id = %order.user_id,
            service_id = %service.id,
            quantity = order.quantity,
            charge = %order.charge,
            "Order placed"
        );

        if let Err(e) = self.queue.enqueue(order.dispatch_job()).await {
            warn!(
                order_id = %order.id,
                error = %e,
                "Dispatch enqueue failed, order left pending for the reconciliation sweep"
            );
        }

        Ok(order)
    }

    /// Re-enqueue a pending order that never reached the provider.
    ///
    /// # Errors
    /// `OrderNotFound`, or `InvalidState` if the order was already dispatched,
    /// is settled, or a worker currently holds its lease.
    pub async fn redispatch(&self, order_id: OrderId) -> ExecResult<Order> {
        let order = self.get_order(order_id).await?;

        if order.status != OrderStatus::Pending || order.upstream_order_id.is_some() {
            return Err(ExecError::InvalidState(format!(
                "order {} is {} and cannot be dispatched again",
                order_id, order.status
            )));
        }
        if order.has_live_lease(chrono::Utc::now()) {
            return Err(ExecError::InvalidState(format!(
                "order {} is being dispatched right now",
                order_id
            )));
        }

        self.queue.enqueue(order.dispatch_job()).await?;
        info!(%order_id, "Order re-enqueued for dispatch");
        Ok(order)
    }

    /// Orders in scope, newest first.
    pub async fn list_orders(&self, scope: OrderScope) -> ExecResult<Vec<Order>> {
        let orders = match scope {
            OrderScope::User(user_id) => self.store.orders().find_by_user(user_id).await?,
            OrderScope::All => self.store.orders().find_all().await?,
        };
        Ok(orders)
    }

    /// Load one order.
    pub async fn get_order(&self, order_id: OrderId) -> ExecResult<Order> {
        self.store
            .orders()
            .find_by_id(order_id)
            .await?
            .ok_or(ExecError::OrderNotFound(order_id))
    }
}
