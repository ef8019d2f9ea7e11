//! Value Objects for the SMM domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pricing::round_money;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Money amounts can never be negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

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

    /// Destination link is empty or malformed
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    /// Unknown enum value while parsing
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// Field being parsed
        field: &'static str,
        /// Offending value
        value: String,
    },

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Money
// =============================================================================

/// Non-negative monetary amount, normalized to 4 decimal places.
///
/// # Invariants
/// - Must be >= 0
/// - Scale never exceeds 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Create a new amount, rounding to 4 decimal places.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAmount` if value < 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(DomainError::InvalidAmount(format!("{} is negative", value)));
        }
        Ok(Self(round_money(value)))
    }

    /// Create a strictly positive amount (ledger postings).
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAmount` if value <= 0 after rounding
    pub fn positive(value: Decimal) -> Result<Self, DomainError> {
        let money = Self::new(value)?;
        if money.is_zero() {
            return Err(DomainError::InvalidAmount("Amount must be positive".to_string()));
        }
        Ok(money)
    }

    /// Zero amount
    pub const fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// True when the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Add two amounts
    pub fn plus(self, other: Money) -> Money {
        Money(self.0 + other.0)
    }

    /// Subtract, returning `None` if the result would be negative
    pub fn checked_minus(self, other: Money) -> Option<Money> {
        if other.0 > self.0 {
            None
        } else {
            Some(Money(self.0 - other.0))
        }
    }

    /// Subtract, flooring at zero
    pub fn saturating_minus(self, other: Money) -> Money {
        self.checked_minus(other).unwrap_or_else(Money::zero)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Link
// =============================================================================

/// Destination link an order is delivered to (profile, post, video...).
///
/// # Invariants
/// - Non-empty after trimming
/// - No whitespace inside
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Link(String);

impl Link {
    /// Maximum accepted link length
    pub const MAX_LEN: usize = 2048;

    /// Parse and normalize a link
    ///
    /// # Errors
    /// Returns `DomainError::InvalidLink` if empty, too long or containing whitespace
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::InvalidLink("Link must not be empty".to_string()));
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidLink(format!(
                "Link exceeds {} characters",
                Self::MAX_LEN
            )));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidLink("Link must not contain whitespace".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the link as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Link {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Link::parse(&value)
    }
}

impl From<Link> for String {
    fn from(value: Link) -> Self {
        value.0
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
