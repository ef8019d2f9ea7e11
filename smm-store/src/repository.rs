//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the domain.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.
//!
//! Reads go through the repositories; every balance change and every order
//! mutation except the dispatch lease goes through [`Store::commit`].

use crate::error::StoreError;
use crate::unit_of_work::{CommitReceipt, UnitOfWork};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smm_domain::{
    Account, Order, OrderId, OrderStatus, Provider, ProviderId, RateChange, Service, ServiceId,
    Transaction, UserId,
};

/// Result of trying to place a dispatch lease on an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Lease placed; the caller owns the dispatch attempt
    Claimed(Order),
    /// Order left `pending` (dispatched, refunded...)
    NotPending(OrderStatus),
    /// Another worker holds a live lease
    Leased {
        /// Lease expiry
        until: DateTime<Utc>,
    },
}

/// Repository for accounts and their ledger entries
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Find an account by owner
    async fn find_account(&self, user_id: UserId) -> Result<Option<Account>, StoreError>;

    /// Ledger entries of an account, newest first
    async fn list_transactions(&self, account_id: UserId) -> Result<Vec<Transaction>, StoreError>;

    /// Ledger entries referencing an order, oldest first
    async fn find_by_reference(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError>;
}

/// Repository for Order entities
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Find an order by ID
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Orders placed by a user, newest first
    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<Order>, StoreError>;

    /// All orders, newest first
    async fn find_all(&self) -> Result<Vec<Order>, StoreError>;

    /// Pending or processing orders that carry an upstream order id
    async fn find_reconcilable(&self) -> Result<Vec<Order>, StoreError>;

    /// Pending orders that were never accepted upstream
    async fn find_undispatched(&self) -> Result<Vec<Order>, StoreError>;

    /// Place a dispatch lease, only while the order is pending and unleased
    async fn claim_dispatch(
        &self,
        id: OrderId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Attach an accepted upstream id to a still-pending order without moving
    /// it to `processing`. The order leaves the stranded sweep and the next
    /// reconciliation pass adopts it. Returns false if nothing was written.
    async fn record_upstream_order(
        &self,
        id: OrderId,
        upstream_order_id: &str,
    ) -> Result<bool, StoreError>;

    /// Drop the dispatch lease of a still-pending order
    async fn release_dispatch(&self, id: OrderId) -> Result<(), StoreError>;
}

/// Repository for the service catalog and providers
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Find a service by ID
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError>;

    /// Services sold through a provider
    async fn find_services_by_provider(
        &self,
        provider_id: ProviderId,
    ) -> Result<Vec<Service>, StoreError>;

    /// Insert or update a service
    async fn save_service(&self, service: &Service) -> Result<(), StoreError>;

    /// Append a rate change record
    async fn record_rate_change(&self, change: &RateChange) -> Result<(), StoreError>;

    /// Rate history of a service, oldest first
    async fn find_rate_changes(&self, service_id: ServiceId)
        -> Result<Vec<RateChange>, StoreError>;

    /// Find a provider by ID
    async fn find_provider(&self, id: ProviderId) -> Result<Option<Provider>, StoreError>;

    /// Providers with status `active`
    async fn find_active_providers(&self) -> Result<Vec<Provider>, StoreError>;

    /// Insert or update a provider
    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError>;
}

/// Combined store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Get account repository
    fn accounts(&self) -> &dyn AccountRepository;

    /// Get order repository
    fn orders(&self) -> &dyn OrderRepository;

    /// Get catalog repository
    fn catalog(&self) -> &dyn CatalogRepository;

    /// Execute a unit of work atomically.
    ///
    /// Order writes are applied first (guards re-checked against the current
    /// rows), then postings. Any failure rolls back everything.
    async fn commit(&self, uow: UnitOfWork) -> Result<CommitReceipt, StoreError>;
}
