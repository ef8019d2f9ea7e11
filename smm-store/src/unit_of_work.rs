//! Unit of work: ledger postings plus guarded order writes, committed as one.
//!
//! A [`UnitOfWork`] is a plain command object. Stores execute it inside a
//! single transaction: order writes (and their status guards) are applied
//! first, then postings, and either everything lands or nothing does.
//!
//! # Example
//!
//! ```rust
//! use smm_domain::{Money, OrderStatus, TransactionKind};
//! use smm_store::{OrderPatch, UnitOfWork};
//! use uuid::Uuid;
//!
//! let order_id = Uuid::now_v7();
//! let user_id = Uuid::now_v7();
//! let amount = Money::positive(rust_decimal::Decimal::ONE).unwrap();
//!
//! let uow = UnitOfWork::new()
//!     .transition(
//!         order_id,
//!         &[OrderStatus::Processing],
//!         OrderStatus::Refunded,
//!         OrderPatch::default().refund(amount),
//!     )
//!     .credit(user_id, amount, TransactionKind::Refund, "cancelled upstream", Some(order_id));
//!
//! assert_eq!(uow.postings().len(), 1);
//! ```

use chrono::{DateTime, Utc};
use smm_domain::{Money, Order, OrderId, OrderStatus, TransactionKind, UserId};

use crate::error::StoreError;

// =============================================================================
// Postings
// =============================================================================

/// Direction of a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingDirection {
    /// Decrease; fails with `InsufficientFunds` if the balance is short
    Debit,
    /// Increase; opens the account if it does not exist
    Credit,
}

/// One balance change and the transaction that records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPosting {
    pub account_id: UserId,
    pub direction: PostingDirection,
    pub amount: Money,
    pub kind: TransactionKind,
    pub description: String,
    pub reference_id: Option<OrderId>,
}

// =============================================================================
// Order writes
// =============================================================================

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPatch {
    pub upstream_order_id: Option<String>,
    pub start_count: Option<u64>,
    pub remains: Option<u64>,
    /// Added to `refunded_amount`
    pub add_refunded: Option<Money>,
    pub clear_lease: bool,
}

impl OrderPatch {
    /// Record the upstream id and drop the dispatch lease
    pub fn dispatched(upstream_order_id: impl Into<String>) -> Self {
        Self {
            upstream_order_id: Some(upstream_order_id.into()),
            clear_lease: true,
            ..Self::default()
        }
    }

    /// Set progress numbers
    pub fn progress(mut self, start_count: u64, remains: u64) -> Self {
        self.start_count = Some(start_count);
        self.remains = Some(remains);
        self
    }

    /// Add to the refunded amount
    pub fn refund(mut self, amount: Money) -> Self {
        self.add_refunded = Some(amount);
        self
    }

    /// Drop any dispatch lease
    pub fn release_lease(mut self) -> Self {
        self.clear_lease = true;
        self
    }
}

/// Order mutation inside a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderWrite {
    /// Persist a new order; fails with `Duplicate` if the id exists
    Insert(Order),
    /// Guarded status change
    Transition {
        order_id: OrderId,
        /// Commit fails with `StaleState` unless the order is in one of these
        expected: Vec<OrderStatus>,
        to: OrderStatus,
        patch: OrderPatch,
    },
}

impl OrderWrite {
    /// Order this write targets
    pub fn order_id(&self) -> OrderId {
        match self {
            Self::Insert(order) => order.id,
            Self::Transition { order_id, .. } => *order_id,
        }
    }

    /// Apply a transition to the current row, checking guard and state machine.
    ///
    /// Shared by every store so the rules live in one place.
    pub fn apply_transition(
        current: &Order,
        expected: &[OrderStatus],
        to: OrderStatus,
        patch: &OrderPatch,
        now: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        if !expected.contains(&current.status) {
            return Err(StoreError::StaleState {
                order_id: current.id,
                actual: current.status,
            });
        }
        if !current.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                order_id: current.id,
                from: current.status,
                to,
            });
        }

        let mut next = current.clone();
        if let Some(amount) = patch.add_refunded {
            let refunded = next.refunded_amount.plus(amount);
            if refunded > next.charge {
                return Err(StoreError::InvalidAmount(format!(
                    "refunds for order {} would reach {} over charge {}",
                    current.id, refunded, next.charge
                )));
            }
            next.refunded_amount = refunded;
        }
        if let Some(id) = &patch.upstream_order_id {
            next.upstream_order_id = Some(id.clone());
        }
        if let Some(start_count) = patch.start_count {
            next.start_count = start_count;
        }
        if let Some(remains) = patch.remains {
            next.remains = remains;
        }
        if patch.clear_lease {
            next.dispatch_lease_until = None;
        }
        next.status = to;
        next.updated_at = now;
        Ok(next)
    }
}

// =============================================================================
// Unit of work
// =============================================================================

/// Batch of postings and order writes executed atomically by `Store::commit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    order_writes: Vec<OrderWrite>,
    postings: Vec<LedgerPosting>,
}

impl UnitOfWork {
    /// Empty unit of work
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new order
    pub fn insert_order(mut self, order: Order) -> Self {
        self.order_writes.push(OrderWrite::Insert(order));
        self
    }

    /// Guarded status transition
    pub fn transition(
        mut self,
        order_id: OrderId,
        expected: &[OrderStatus],
        to: OrderStatus,
        patch: OrderPatch,
    ) -> Self {
        self.order_writes.push(OrderWrite::Transition {
            order_id,
            expected: expected.to_vec(),
            to,
            patch,
        });
        self
    }

    /// Conditional debit
    pub fn debit(
        self,
        account_id: UserId,
        amount: Money,
        kind: TransactionKind,
        description: impl Into<String>,
        reference_id: Option<OrderId>,
    ) -> Self {
        self.post(PostingDirection::Debit, account_id, amount, kind, description, reference_id)
    }

    /// Unconditional credit
    pub fn credit(
        self,
        account_id: UserId,
        amount: Money,
        kind: TransactionKind,
        description: impl Into<String>,
        reference_id: Option<OrderId>,
    ) -> Self {
        self.post(PostingDirection::Credit, account_id, amount, kind, description, reference_id)
    }

    fn post(
        mut self,
        direction: PostingDirection,
        account_id: UserId,
        amount: Money,
        kind: TransactionKind,
        description: impl Into<String>,
        reference_id: Option<OrderId>,
    ) -> Self {
        self.postings.push(LedgerPosting {
            account_id,
            direction,
            amount,
            kind,
            description: description.into(),
            reference_id,
        });
        self
    }

    /// Order writes in execution order
    pub fn order_writes(&self) -> &[OrderWrite] {
        &self.order_writes
    }

    /// Postings in execution order
    pub fn postings(&self) -> &[LedgerPosting] {
        &self.postings
    }

    /// True if there is nothing to commit
    pub fn is_empty(&self) -> bool {
        self.order_writes.is_empty() && self.postings.is_empty()
    }

    /// Reject zero-amount postings before touching storage
    pub fn validate(&self) -> Result<(), StoreError> {
        for posting in &self.postings {
            if posting.amount.is_zero() {
                return Err(StoreError::InvalidAmount(format!(
                    "{} posting for account {} must be positive",
                    posting.kind, posting.account_id
                )));
            }
        }
        Ok(())
    }

    /// Split into order writes and postings
    pub fn into_parts(self) -> (Vec<OrderWrite>, Vec<LedgerPosting>) {
        (self.order_writes, self.postings)
    }
}

/// Rows written by a committed unit of work.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Ledger entries, one per posting, in posting order
    pub transactions: Vec<smm_domain::Transaction>,
    /// Final state of every written order, in write order
    pub orders: Vec<Order>,
}

impl CommitReceipt {
    /// Final state of `order_id` if this unit wrote it
    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.iter().rev().find(|o| o.id == order_id)
    }
}
