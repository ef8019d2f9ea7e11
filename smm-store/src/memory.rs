//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! All tables sit behind one mutex so a unit of work is applied atomically:
//! changes are staged on copies and written back only when every step passed.

use crate::error::StoreError;
use crate::repository::{
    AccountRepository, CatalogRepository, ClaimOutcome, OrderRepository, Store,
};
use crate::unit_of_work::{CommitReceipt, LedgerPosting, OrderWrite, PostingDirection, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smm_domain::{
    Account, Money, Order, OrderId, OrderStatus, Provider, ProviderId, ProviderStatus,
    RateChange, Service, ServiceId, Transaction, TransactionStatus, UserId,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    accounts: HashMap<UserId, Account>,
    transactions: Vec<Transaction>,
    orders: HashMap<OrderId, Order>,
    services: HashMap<ServiceId, Service>,
    providers: HashMap<ProviderId, Provider>,
    rate_changes: Vec<RateChange>,
    /// Error returned by the next `commit` (test fault injection)
    commit_failure: Option<String>,
}

/// In-memory store for testing
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Database(format!("memory store lock poisoned: {}", e)))
    }

    /// Get the number of orders
    pub fn order_count(&self) -> usize {
        self.lock().map(|t| t.orders.len()).unwrap_or(0)
    }

    /// Get the number of ledger entries
    pub fn transaction_count(&self) -> usize {
        self.lock().map(|t| t.transactions.len()).unwrap_or(0)
    }

    /// Every ledger entry in insertion order (test assertions)
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.lock().map(|t| t.transactions.clone()).unwrap_or_default()
    }

    /// Every account (test assertions)
    pub fn all_accounts(&self) -> Vec<Account> {
        self.lock().map(|t| t.accounts.values().cloned().collect()).unwrap_or_default()
    }

    /// Make the next `commit` fail with a database error, writing nothing
    pub fn fail_next_commit(&self, message: impl Into<String>) -> Result<(), StoreError> {
        self.lock()?.commit_failure = Some(message.into());
        Ok(())
    }

    /// Overwrite an order row directly, bypassing guards (test setup)
    pub fn put_order(&self, order: Order) -> Result<(), StoreError> {
        self.lock()?.orders.insert(order.id, order);
        Ok(())
    }
}

fn newest_first(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    orders
}

/// Apply one posting against the staged account, returning its ledger entry.
fn post(
    account: &mut Account,
    posting: &LedgerPosting,
    now: DateTime<Utc>,
) -> Result<Transaction, StoreError> {
    let before = account.balance;
    let after = match posting.direction {
        PostingDirection::Debit => {
            before.checked_minus(posting.amount).ok_or(StoreError::InsufficientFunds {
                account_id: posting.account_id,
                required: posting.amount,
                available: before,
            })?
        },
        PostingDirection::Credit => before.plus(posting.amount),
    };

    account.balance = after;
    account.updated_at = now;

    Ok(Transaction {
        id: Uuid::now_v7(),
        account_id: posting.account_id,
        amount: posting.amount,
        balance_before: before,
        balance_after: after,
        kind: posting.kind,
        status: TransactionStatus::Completed,
        description: posting.description.clone(),
        reference_id: posting.reference_id,
        created_at: now,
    })
}

// =============================================================================
// Account Repository Implementation
// =============================================================================

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn find_account(&self, user_id: UserId) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(&user_id).cloned())
    }

    async fn list_transactions(&self, account_id: UserId) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn find_by_reference(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.reference_id == Some(order_id))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError> {
        let tables = self.lock()?;
        Ok(newest_first(
            tables.orders.values().filter(|o| o.user_id == user_id).cloned().collect(),
        ))
    }

    async fn find_all(&self) -> Result<Vec<Order>, StoreError> {
        Ok(newest_first(self.lock()?.orders.values().cloned().collect()))
    }

    async fn find_reconcilable(&self) -> Result<Vec<Order>, StoreError> {
        let tables = self.lock()?;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.status.is_in_flight() && o.upstream_order_id.is_some())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn find_undispatched(&self) -> Result<Vec<Order>, StoreError> {
        let tables = self.lock()?;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.upstream_order_id.is_none())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn claim_dispatch(
        &self,
        id: OrderId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut tables = self.lock()?;
        let order = tables
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id.to_string()))?;

        if order.status != OrderStatus::Pending || order.upstream_order_id.is_some() {
            return Ok(ClaimOutcome::NotPending(order.status));
        }
        if let Some(until) = order.dispatch_lease_until.filter(|until| *until > now) {
            return Ok(ClaimOutcome::Leased { until });
        }

        order.dispatch_lease_until = Some(lease_until);
        order.updated_at = now;
        Ok(ClaimOutcome::Claimed(order.clone()))
    }

    async fn record_upstream_order(
        &self,
        id: OrderId,
        upstream_order_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(false);
        };
        if order.status != OrderStatus::Pending || order.upstream_order_id.is_some() {
            return Ok(false);
        }
        order.upstream_order_id = Some(upstream_order_id.to_string());
        order.dispatch_lease_until = None;
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_dispatch(&self, id: OrderId) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if let Some(order) = tables.orders.get_mut(&id) {
            if order.status == OrderStatus::Pending {
                order.dispatch_lease_until = None;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Catalog Repository Implementation
// =============================================================================

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self.lock()?.services.get(&id).cloned())
    }

    async fn find_services_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<Service>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.services.values().filter(|s| s.provider_id == provider_id).cloned().collect())
    }

    async fn save_service(&self, service: &Service) -> Result<(), StoreError> {
        self.lock()?.services.insert(service.id, service.clone());
        Ok(())
    }

    async fn record_rate_change(&self, change: &RateChange) -> Result<(), StoreError> {
        self.lock()?.rate_changes.push(change.clone());
        Ok(())
    }

    async fn find_rate_changes(
        &self,
        service_id: ServiceId,
    ) -> Result<Vec<RateChange>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.rate_changes.iter().filter(|c| c.service_id == service_id).cloned().collect())
    }

    async fn find_provider(&self, id: ProviderId) -> Result<Option<Provider>, StoreError> {
        Ok(self.lock()?.providers.get(&id).cloned())
    }

    async fn find_active_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .providers
            .values()
            .filter(|p| p.status == ProviderStatus::Active)
            .cloned()
            .collect())
    }

    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        self.lock()?.providers.insert(provider.id, provider.clone());
        Ok(())
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for MemoryStore {
    fn accounts(&self) -> &dyn AccountRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn catalog(&self) -> &dyn CatalogRepository {
        self
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        uow.validate()?;
        let now = Utc::now();
        let (writes, postings) = uow.into_parts();

        let mut tables = self.lock()?;
        if let Some(message) = tables.commit_failure.take() {
            return Err(StoreError::Database(message));
        }

        // Stage order writes
        let mut staged_orders: HashMap<OrderId, Order> = HashMap::new();
        let mut written = Vec::with_capacity(writes.len());
        for write in writes {
            let next = match write {
                OrderWrite::Insert(order) => {
                    if tables.orders.contains_key(&order.id) || staged_orders.contains_key(&order.id)
                    {
                        return Err(StoreError::duplicate("order", order.id.to_string()));
                    }
                    order
                },
                OrderWrite::Transition {
                    order_id,
                    expected,
                    to,
                    patch,
                } => {
                    let current = staged_orders
                        .get(&order_id)
                        .or_else(|| tables.orders.get(&order_id))
                        .ok_or_else(|| StoreError::not_found("order", order_id.to_string()))?;
                    OrderWrite::apply_transition(current, &expected, to, &patch, now)?
                },
            };
            written.push(next.clone());
            staged_orders.insert(next.id, next);
        }

        // Stage postings
        let mut staged_accounts: HashMap<UserId, Account> = HashMap::new();
        let mut entries = Vec::with_capacity(postings.len());
        for posting in &postings {
            let account = match staged_accounts.remove(&posting.account_id) {
                Some(account) => account,
                None => match tables.accounts.get(&posting.account_id) {
                    Some(account) => account.clone(),
                    None if posting.direction == PostingDirection::Credit => {
                        Account::open(posting.account_id)
                    },
                    None => {
                        return Err(StoreError::InsufficientFunds {
                            account_id: posting.account_id,
                            required: posting.amount,
                            available: Money::zero(),
                        })
                    },
                },
            };
            let mut account = account;
            entries.push(post(&mut account, posting, now)?);
            staged_accounts.insert(account.user_id, account);
        }

        // Everything passed: write back
        tables.orders.extend(staged_orders);
        tables.accounts.extend(staged_accounts);
        tables.transactions.extend(entries.iter().cloned());

        Ok(CommitReceipt {
            transactions: entries,
            orders: written,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_of_work::OrderPatch;
    use rust_decimal_macros::dec;
    use smm_domain::{Link, TransactionKind};

    fn test_service() -> Service {
        Service::new(
            "Followers",
            Uuid::now_v7(),
            "101",
            dec!(2.50),
            dec!(0),
            dec!(0),
            None,
            100,
            10_000,
        )
        .unwrap()
    }

    fn money(value: rust_decimal::Decimal) -> Money {
        Money::new(value).unwrap()
    }

    async fn funded(store: &MemoryStore, amount: rust_decimal::Decimal) -> UserId {
        let user = Uuid::now_v7();
        store
            .commit(UnitOfWork::new().credit(
                user,
                money(amount),
                TransactionKind::Deposit,
                "deposit",
                None,
            ))
            .await
            .unwrap();
        user
    }

    #[tokio::test]
    async fn test_credit_opens_account_and_logs() {
        let store = MemoryStore::new();
        let user = funded(&store, dec!(10)).await;

        let account = store.find_account(user).await.unwrap().unwrap();
        assert_eq!(account.balance.as_decimal(), dec!(10));

        let txs = store.list_transactions(user).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].balance_before.as_decimal(), dec!(0));
        assert_eq!(txs[0].balance_after.as_decimal(), dec!(10));
    }

    #[tokio::test]
    async fn test_debit_insufficient_has_no_effect() {
        let store = MemoryStore::new();
        let user = funded(&store, dec!(3)).await;

        let err = store
            .commit(UnitOfWork::new().debit(
                user,
                money(dec!(5)),
                TransactionKind::Order,
                "too much",
                None,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
        assert_eq!(store.find_account(user).await.unwrap().unwrap().balance.as_decimal(), dec!(3));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_debit_unknown_account_is_insufficient() {
        let store = MemoryStore::new();
        let err = store
            .commit(UnitOfWork::new().debit(
                Uuid::now_v7(),
                money(dec!(1)),
                TransactionKind::Order,
                "x",
                None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_failed_guard_rolls_back_postings() {
        let store = MemoryStore::new();
        let user = funded(&store, dec!(10)).await;
        let order = Order::new_pending(
            user,
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            1000,
        )
        .unwrap();
        store.put_order(order.clone()).unwrap();

        let err = store
            .commit(
                UnitOfWork::new()
                    .credit(user, money(dec!(2.5)), TransactionKind::Refund, "refund", Some(order.id))
                    .transition(
                        order.id,
                        &[OrderStatus::Processing],
                        OrderStatus::Refunded,
                        OrderPatch::default(),
                    ),
            )
            .await
            .unwrap_err();

        assert!(err.is_stale());
        assert_eq!(store.find_account(user).await.unwrap().unwrap().balance.as_decimal(), dec!(10));
        assert_eq!(store.find_by_id(order.id).await.unwrap().unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_order_with_debit() {
        let store = MemoryStore::new();
        let user = funded(&store, dec!(10)).await;
        let order = Order::new_pending(
            user,
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            2000,
        )
        .unwrap();

        let receipt = store
            .commit(
                UnitOfWork::new()
                    .debit(user, order.charge, TransactionKind::Order, "order", Some(order.id))
                    .insert_order(order.clone()),
            )
            .await
            .unwrap();

        assert_eq!(receipt.transactions.len(), 1);
        assert_eq!(receipt.transactions[0].signed_amount(), dec!(-5));
        assert!(receipt.order(order.id).is_some());
        assert_eq!(store.find_by_user(user).await.unwrap().len(), 1);

        // Same id again is a duplicate and debits nothing
        let err = store
            .commit(
                UnitOfWork::new()
                    .debit(user, order.charge, TransactionKind::Order, "order", Some(order.id))
                    .insert_order(order.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        assert_eq!(store.find_account(user).await.unwrap().unwrap().balance.as_decimal(), dec!(5));
    }

    #[tokio::test]
    async fn test_claim_dispatch_lease() {
        let store = MemoryStore::new();
        let order = Order::new_pending(
            Uuid::now_v7(),
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            100,
        )
        .unwrap();
        store.put_order(order.clone()).unwrap();

        let now = Utc::now();
        let until = now + chrono::Duration::seconds(60);

        assert!(matches!(
            store.claim_dispatch(order.id, until, now).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.claim_dispatch(order.id, until, now).await.unwrap(),
            ClaimOutcome::Leased { .. }
        ));

        store.release_dispatch(order.id).await.unwrap();
        assert!(matches!(
            store.claim_dispatch(order.id, until, now).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_record_upstream_order_leaves_sweep() {
        let store = MemoryStore::new();
        let order = Order::new_pending(
            Uuid::now_v7(),
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            100,
        )
        .unwrap();
        store.put_order(order.clone()).unwrap();
        let now = Utc::now();
        store.claim_dispatch(order.id, now + chrono::Duration::seconds(60), now).await.unwrap();

        assert!(store.record_upstream_order(order.id, "U-9").await.unwrap());
        assert!(!store.record_upstream_order(order.id, "U-10").await.unwrap());

        let stored = store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.upstream_order_id.as_deref(), Some("U-9"));
        assert!(store.find_undispatched().await.unwrap().is_empty());
        assert_eq!(store.find_reconcilable().await.unwrap().len(), 1);
        assert_eq!(
            store.claim_dispatch(order.id, now, now).await.unwrap(),
            ClaimOutcome::NotPending(OrderStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_next_commit("disk full").unwrap();
        let user = Uuid::now_v7();
        let deposit = UnitOfWork::new().credit(
            user,
            Money::new(dec!(5)).unwrap(),
            TransactionKind::Deposit,
            "deposit",
            None,
        );

        assert!(matches!(store.commit(deposit).await, Err(StoreError::Database(_))));
        assert!(store.find_account(user).await.unwrap().is_none());
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_claim_expired_lease() {
        let store = MemoryStore::new();
        let mut order = Order::new_pending(
            Uuid::now_v7(),
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            100,
        )
        .unwrap();
        let now = Utc::now();
        order.dispatch_lease_until = Some(now - chrono::Duration::seconds(1));
        store.put_order(order.clone()).unwrap();

        assert!(matches!(
            store.claim_dispatch(order.id, now + chrono::Duration::seconds(60), now).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_claim_not_pending() {
        let store = MemoryStore::new();
        let mut order = Order::new_pending(
            Uuid::now_v7(),
            &test_service(),
            Link::parse("https://t.me/channel").unwrap(),
            100,
        )
        .unwrap();
        order.status = OrderStatus::Refunded;
        store.put_order(order.clone()).unwrap();

        let now = Utc::now();
        assert_eq!(
            store.claim_dispatch(order.id, now, now).await.unwrap(),
            ClaimOutcome::NotPending(OrderStatus::Refunded)
        );
    }
}
