//! Execution layer error types.

use smm_domain::{DomainError, Money, OrderId};
use smm_store::StoreError;
use thiserror::Error;

/// Errors that can occur during execution operations.
///
/// `ServiceUnavailable`, `InvalidQuantity`, `InvalidLink` and
/// `InsufficientFunds` are the synchronous placement failures; they are
/// always returned before anything was written.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Service missing or not active
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Quantity outside of the service bounds
    #[error("Quantity must be between {min} and {max}, got {requested}")]
    InvalidQuantity {
        /// Lower bound (inclusive)
        min: u32,
        /// Upper bound (inclusive)
        max: u32,
        /// Requested quantity
        requested: u32,
    },

    /// Destination link empty or malformed
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    /// Balance below the charge
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        required: Money,
        /// Balance at the time of the check
        available: Money,
    },

    /// Zero or negative monetary amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Unknown order
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// Provider explicitly rejected the request
    #[error("Upstream rejected: {0}")]
    UpstreamRejected(String),

    /// Timeout or transport failure talking to the provider
    #[error("Upstream unavailable: {0}")]
    UpstreamTransient(String),

    /// Provider missing, disabled or its key unusable
    #[error("Provider error: {0}")]
    Provider(String),

    /// Dispatch queue failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(DomainError),
}

impl ExecError {
    /// True for failures worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient(_)
                | Self::Queue(_)
                | Self::Store(StoreError::Database(_))
                | Self::Store(StoreError::Connection(_))
        )
    }
}

impl From<DomainError> for ExecError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidQuantity { min, max, requested } => {
                Self::InvalidQuantity { min, max, requested }
            },
            DomainError::InvalidLink(msg) => Self::InvalidLink(msg),
            DomainError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            other => Self::Domain(other),
        }
    }
}

impl From<StoreError> for ExecError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds { required, available, .. } => {
                Self::InsufficientFunds { required, available }
            },
            StoreError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            StoreError::InvalidTransition { order_id, from, to } => Self::InvalidState(format!(
                "order {} cannot move from {} to {}",
                order_id, from, to
            )),
            StoreError::Domain(domain) => domain.into(),
            other => Self::Store(other),
        }
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
