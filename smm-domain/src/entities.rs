//! Domain entities: accounts, orders, ledger transactions and the catalog.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::credentials::EncryptedSecret;
use crate::pricing::{compute_charge, compute_selling_price};
use crate::value_objects::{DomainError, Link, Money};

/// User identifier (accounts are keyed by their owner)
pub type UserId = Uuid;
/// Order identifier
pub type OrderId = Uuid;
/// Ledger transaction identifier
pub type TransactionId = Uuid;
/// Catalog service identifier
pub type ServiceId = Uuid;
/// Upstream provider identifier
pub type ProviderId = Uuid;

// =============================================================================
// Account
// =============================================================================

/// Spendable balance of a user.
///
/// Only the ledger mutates `balance`; it always equals the sum of the
/// account's signed transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner of the account
    pub user_id: UserId,
    /// Current balance
    pub balance: Money,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Empty account for a user
    pub fn open(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Money::zero(),
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Order
// =============================================================================

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Charged, waiting for dispatch
    Pending,
    /// Accepted by the upstream provider
    Processing,
    /// Fully delivered
    Completed,
    /// Delivery stopped short; undelivered part credited back
    Partial,
    /// Cancelled without a credit (never written by the pipeline)
    Cancelled,
    /// Charge returned to the account
    Refunded,
}

impl OrderStatus {
    /// Stable lowercase name (storage and API)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// True once no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }

    /// Orders the reconciliation pass still has to watch
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Order state machine.
    ///
    /// `processing -> processing` is allowed so progress numbers can be
    /// written under the same guard. Completed and partial orders can still
    /// be refunded by an operator.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending | Processing, Processing | Completed | Partial | Refunded) => true,
            (Partial | Completed, Refunded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(DomainError::InvalidValue {
                field: "order status",
                value: other.to_string(),
            }),
        }
    }
}

/// One purchase and its fulfillment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub provider_id: ProviderId,
    pub upstream_service_id: String,
    pub link: Link,
    pub quantity: u32,
    /// Fixed at placement
    pub charge: Money,
    pub status: OrderStatus,

    // Upstream tracking
    pub upstream_order_id: Option<String>,
    pub start_count: u64,
    pub remains: u64,

    /// Credits already returned for this order
    pub refunded_amount: Money,
    /// Worker claim; a live lease means a dispatch attempt is in progress
    pub dispatch_lease_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending order for `service`, charging the catalog price.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` when `quantity` is outside the
    /// service bounds.
    pub fn new_pending(
        user_id: UserId,
        service: &Service,
        link: Link,
        quantity: u32,
    ) -> Result<Self, DomainError> {
        service.validate_quantity(quantity)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            user_id,
            service_id: service.id,
            provider_id: service.provider_id,
            upstream_service_id: service.upstream_service_id.clone(),
            link,
            quantity,
            charge: service.charge_for(quantity),
            status: OrderStatus::Pending,
            upstream_order_id: None,
            start_count: 0,
            remains: u64::from(quantity),
            refunded_amount: Money::zero(),
            dispatch_lease_until: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Part of the charge not yet credited back
    pub fn outstanding_charge(&self) -> Money {
        self.charge.saturating_minus(self.refunded_amount)
    }

    /// Refunded or cancelled: the refund path has nothing left to do
    pub fn is_settled(&self) -> bool {
        matches!(self.status, OrderStatus::Refunded | OrderStatus::Cancelled)
    }

    /// True while a worker holds an unexpired dispatch lease
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.dispatch_lease_until.map(|until| until > now).unwrap_or(false)
    }

    /// Pending, never accepted upstream and not claimed by a worker
    pub fn awaits_dispatch(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending
            && self.upstream_order_id.is_none()
            && !self.has_live_lease(now)
    }

    /// Queue payload for dispatching this order
    pub fn dispatch_job(&self) -> DispatchJob {
        DispatchJob {
            order_id: self.id,
            provider_ref: self.provider_id,
            service_ref: ServiceRef {
                upstream_service_id: self.upstream_service_id.clone(),
            },
            link: self.link.clone(),
            quantity: self.quantity,
        }
    }
}

// =============================================================================
// Dispatch Job
// =============================================================================

/// Upstream reference of a catalog service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    /// Service id on the provider side
    pub upstream_service_id: String,
}

/// "Fulfill this order" queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    /// Order to dispatch
    pub order_id: OrderId,
    /// Provider that fulfills it
    pub provider_ref: ProviderId,
    /// Upstream service reference
    pub service_ref: ServiceRef,
    /// Destination link
    pub link: Link,
    /// Units purchased
    pub quantity: u32,
}

// =============================================================================
// Ledger Transaction
// =============================================================================

/// Kind of balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Funds added by a payment
    Deposit,
    /// Funds paid out
    Withdrawal,
    /// Order charge
    Order,
    /// Order charge returned
    Refund,
    /// Operator adjustment
    Manual,
}

impl TransactionKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Order => "order",
            Self::Refund => "refund",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "order" => Ok(Self::Order),
            "refund" => Ok(Self::Refund),
            "manual" => Ok(Self::Manual),
            other => Err(DomainError::InvalidValue {
                field: "transaction kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Settlement status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::InvalidValue {
                field: "transaction status",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable ledger entry, written exactly once per balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: UserId,
    /// Magnitude of the mutation (always positive)
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub description: String,
    /// Order this entry belongs to, if any
    pub reference_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed effect on the balance (negative for debits)
    pub fn signed_amount(&self) -> Decimal {
        self.balance_after.as_decimal() - self.balance_before.as_decimal()
    }

    /// True if the entry increased the balance
    pub fn is_credit(&self) -> bool {
        self.balance_after > self.balance_before
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Availability of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Disabled,
}

impl ServiceStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(DomainError::InvalidValue {
                field: "service status",
                value: other.to_string(),
            }),
        }
    }
}

/// Catalog entry resold to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub provider_id: ProviderId,
    pub upstream_service_id: String,
    /// Upstream cost per 1000 units
    pub provider_rate: Decimal,
    pub fixed_margin: Decimal,
    /// Margin in percent of the provider rate
    pub percent_margin: Decimal,
    /// Overrides the margin formula when positive
    pub custom_price: Option<Decimal>,
    /// Price per 1000 units, derived by [`compute_selling_price`]
    pub selling_price: Decimal,
    pub min_order: u32,
    pub max_order: u32,
    pub status: ServiceStatus,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Build an active service and derive its selling price.
    ///
    /// # Errors
    /// Returns an error if the rate is negative or the bounds are inverted.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        provider_id: ProviderId,
        upstream_service_id: impl Into<String>,
        provider_rate: Decimal,
        fixed_margin: Decimal,
        percent_margin: Decimal,
        custom_price: Option<Decimal>,
        min_order: u32,
        max_order: u32,
    ) -> Result<Self, DomainError> {
        if provider_rate.is_sign_negative() && !provider_rate.is_zero() {
            return Err(DomainError::InvalidAmount(format!(
                "provider rate {} is negative",
                provider_rate
            )));
        }
        if min_order == 0 || min_order > max_order {
            return Err(DomainError::InvalidQuantity {
                min: min_order,
                max: max_order,
                requested: min_order,
            });
        }

        let mut service = Self {
            id: Uuid::now_v7(),
            name: name.into(),
            provider_id,
            upstream_service_id: upstream_service_id.into(),
            provider_rate,
            fixed_margin,
            percent_margin,
            custom_price,
            selling_price: Decimal::ZERO,
            min_order,
            max_order,
            status: ServiceStatus::Active,
            updated_at: Utc::now(),
        };
        service.reprice(provider_rate)?;
        Ok(service)
    }

    /// Apply a new upstream rate and recompute the selling price.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAmount` if the resulting price is negative.
    pub fn reprice(&mut self, provider_rate: Decimal) -> Result<(), DomainError> {
        let price = compute_selling_price(
            provider_rate,
            self.fixed_margin,
            self.percent_margin,
            self.custom_price,
        );
        if price.is_sign_negative() && !price.is_zero() {
            return Err(DomainError::InvalidAmount(format!("selling price {} is negative", price)));
        }
        self.provider_rate = provider_rate;
        self.selling_price = price;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether new orders may be placed
    pub fn is_active(&self) -> bool {
        self.status == ServiceStatus::Active
    }

    /// Check `min_order <= quantity <= max_order`
    pub fn validate_quantity(&self, quantity: u32) -> Result<(), DomainError> {
        if quantity < self.min_order || quantity > self.max_order {
            return Err(DomainError::InvalidQuantity {
                min: self.min_order,
                max: self.max_order,
                requested: quantity,
            });
        }
        Ok(())
    }

    /// Charge for `quantity` units
    pub fn charge_for(&self, quantity: u32) -> Money {
        compute_charge(self.selling_price, quantity)
    }
}

/// Historical record of an upstream rate change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateChange {
    pub service_id: ServiceId,
    pub provider_id: ProviderId,
    pub old_rate: Decimal,
    pub new_rate: Decimal,
    /// `None` when the old rate was zero
    pub change_percent: Option<Decimal>,
    pub recorded_at: DateTime<Utc>,
}

impl RateChange {
    /// Record a move from `old_rate` to `new_rate`
    pub fn between(service: &Service, old_rate: Decimal, new_rate: Decimal) -> Self {
        let change_percent = if old_rate.is_zero() {
            None
        } else {
            Some(((new_rate - old_rate) / old_rate * Decimal::ONE_HUNDRED).round_dp(4))
        };
        Self {
            service_id: service.id,
            provider_id: service.provider_id,
            old_rate,
            new_rate,
            change_percent,
            recorded_at: Utc::now(),
        }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Wire shape spoken by a provider; selects the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Classic `action=add|status|balance|services|cancel` panel API
    Standard,
}

impl ProviderKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            other => Err(DomainError::InvalidValue {
                field: "provider kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether a provider takes part in dispatch and rate sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Receives orders
    Active,
    /// Skipped by dispatch and rate sync
    Disabled,
}

impl ProviderStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for ProviderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(DomainError::InvalidValue {
                field: "provider status",
                value: other.to_string(),
            }),
        }
    }
}

/// Upstream fulfillment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Unique identifier
    pub id: ProviderId,
    /// Display name
    pub name: String,
    /// Single API endpoint
    pub api_url: String,
    /// Wire shape
    pub kind: ProviderKind,
    /// Whether the provider is in use
    pub status: ProviderStatus,
    /// Encrypted API key, never serialized
    #[serde(skip_serializing)]
    pub api_key: EncryptedSecret,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_service() -> Service {
        Service::new(
            "Instagram Followers",
            Uuid::now_v7(),
            "101",
            dec!(2.00),
            dec!(0),
            dec!(25),
            None,
            100,
            10_000,
        )
        .unwrap()
    }

    #[test]
    fn test_service_prices_on_creation() {
        let service = test_service();
        assert_eq!(service.selling_price, dec!(2.5));
    }

    #[test]
    fn test_service_rejects_inverted_bounds() {
        let result =
            Service::new("x", Uuid::now_v7(), "1", dec!(1), dec!(0), dec!(0), None, 500, 100);
        assert!(result.is_err());
    }

    #[test]
    fn test_order_charge_and_job() {
        let service = test_service();
        let link = Link::parse("https://instagram.com/someone").unwrap();
        let order = Order::new_pending(Uuid::now_v7(), &service, link, 2000).unwrap();

        assert_eq!(order.charge.as_decimal(), dec!(5.0000));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.outstanding_charge(), order.charge);

        let job = order.dispatch_job();
        assert_eq!(job.order_id, order.id);
        assert_eq!(job.service_ref.upstream_service_id, "101");
    }

    #[test]
    fn test_order_rejects_quantity_out_of_bounds() {
        let service = test_service();
        let link = Link::parse("https://instagram.com/someone").unwrap();
        let err = Order::new_pending(Uuid::now_v7(), &service, link, 50).unwrap_err();
        assert!(matches!(err, DomainError::InvalidQuantity { requested: 50, .. }));
    }

    #[test]
    fn test_status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Refunded));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Partial));
        assert!(Partial.can_transition_to(Refunded));
        assert!(Completed.can_transition_to(Refunded));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Refunded.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Refunded));
        assert!(!Partial.can_transition_to(Completed));
        assert!(!Completed.is_terminal());
        assert!(Refunded.is_terminal());
    }

    #[test]
    fn test_dispatch_job_wire_shape() {
        let service = test_service();
        let link = Link::parse("https://instagram.com/someone").unwrap();
        let order = Order::new_pending(Uuid::now_v7(), &service, link, 200).unwrap();

        let json = serde_json::to_value(order.dispatch_job()).unwrap();
        assert_eq!(json["serviceRef"]["upstreamServiceId"], "101");
        assert_eq!(json["quantity"], 200);
        assert!(json.get("orderId").is_some());
        assert!(json.get("providerRef").is_some());
    }

    #[test]
    fn test_rate_change_percent() {
        let service = test_service();
        let change = RateChange::between(&service, dec!(2.00), dec!(2.50));
        assert_eq!(change.change_percent, Some(dec!(25)));
        assert!(RateChange::between(&service, dec!(0), dec!(1)).change_percent.is_none());
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Completed,
            OrderStatus::Partial,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }
}
