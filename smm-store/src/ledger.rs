//! Ledger: single-posting debit and credit on top of `Store::commit`.
//!
//! The balance change and its transaction row always land in the same unit
//! of work, so no balance moves without a log entry and vice versa.

use std::sync::Arc;

use smm_domain::{Money, OrderId, Transaction, TransactionKind, UserId};
use tracing::info;

use crate::error::StoreError;
use crate::repository::Store;
use crate::unit_of_work::UnitOfWork;

/// Atomic balance operations for one account at a time.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    /// Wrap a store
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Current balance, zero for an account that was never credited
    pub async fn balance(&self, account_id: UserId) -> Result<Money, StoreError> {
        Ok(self
            .store
            .accounts()
            .find_account(account_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or_default())
    }

    /// Conditional decrease.
    ///
    /// # Errors
    /// `InsufficientFunds` when the balance is below `amount`,
    /// `InvalidAmount` when `amount` is zero.
    pub async fn debit(
        &self,
        account_id: UserId,
        amount: Money,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<OrderId>,
    ) -> Result<Transaction, StoreError> {
        let uow = UnitOfWork::new().debit(account_id, amount, kind, description, reference_id);
        let tx = self.single(uow).await?;
        info!(%account_id, amount = %amount, balance = %tx.balance_after, kind = %kind, "Account debited");
        Ok(tx)
    }

    /// Unconditional increase (deposits, manual adjustments, refunds).
    ///
    /// # Errors
    /// `InvalidAmount` when `amount` is zero.
    pub async fn credit(
        &self,
        account_id: UserId,
        amount: Money,
        kind: TransactionKind,
        description: &str,
        reference_id: Option<OrderId>,
    ) -> Result<Transaction, StoreError> {
        let uow = UnitOfWork::new().credit(account_id, amount, kind, description, reference_id);
        let tx = self.single(uow).await?;
        info!(%account_id, amount = %amount, balance = %tx.balance_after, kind = %kind, "Account credited");
        Ok(tx)
    }

    async fn single(&self, uow: UnitOfWork) -> Result<Transaction, StoreError> {
        self.store
            .commit(uow)
            .await?
            .transactions
            .pop()
            .ok_or_else(|| StoreError::Database("commit returned no ledger entry".to_string()))
    }
}
