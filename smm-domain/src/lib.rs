//! SMM Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains entities, value objects, pricing rules and the provider-agnostic
//! shapes exchanged with upstream fulfillment APIs.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod credentials;
pub mod entities;
pub mod pricing;
pub mod upstream;
pub mod value_objects;

// Re-export commonly used types
pub use credentials::{ApiKey, EncryptedSecret};
pub use entities::{
    Account, DispatchJob, Order, OrderId, OrderStatus, Provider, ProviderId, ProviderKind,
    ProviderStatus, RateChange, Service, ServiceId, ServiceRef, ServiceStatus, Transaction,
    TransactionId, TransactionKind, TransactionStatus, UserId,
};
pub use pricing::{compute_charge, compute_selling_price, round_money};
pub use upstream::{StatusReport, UpstreamStatus};
pub use value_objects::{DomainError, Link, Money};
