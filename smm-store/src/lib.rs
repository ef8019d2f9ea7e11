//! SMM Storage Layer
//!
//! Provides persistence for accounts, the ledger, orders and the catalog.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **Unit of work**: Ledger postings and guarded order writes committed atomically
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use smm_domain::{Money, TransactionKind};
//! use smm_store::{AccountRepository, MemoryStore, Store, UnitOfWork};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let user = Uuid::now_v7();
//!
//!     let amount = Money::positive(rust_decimal::Decimal::TEN).unwrap();
//!     store
//!         .commit(UnitOfWork::new().credit(user, amount, TransactionKind::Deposit, "top up", None))
//!         .await
//!         .unwrap();
//!
//!     let account = store.find_account(user).await.unwrap().unwrap();
//!     println!("Balance: {}", account.balance);
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod crypto;
mod error;
mod ledger;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;
mod unit_of_work;

// Re-exports
pub use crypto::ProviderKeyCipher;
pub use error::StoreError;
pub use ledger::Ledger;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use repository::{
    AccountRepository, CatalogRepository, ClaimOutcome, OrderRepository, Store,
};
pub use unit_of_work::{
    CommitReceipt, LedgerPosting, OrderPatch, OrderWrite, PostingDirection, UnitOfWork,
};
