//! Pricing rules.
//!
//! Plain functions, called explicitly wherever a service is created or
//! re-priced and wherever an order is charged. Rates and prices are
//! expressed per 1000 units.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::value_objects::Money;

/// Number of decimal places kept for every monetary value.
pub const MONEY_SCALE: u32 = 4;

/// Units a rate or selling price refers to.
const PRICE_UNIT: u32 = 1000;

/// Round to the money scale, midpoint away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Selling price for a catalog entry.
///
/// A positive `custom_price` overrides the margin formula. Otherwise:
/// `provider_rate * (1 + percent_margin / 100) + fixed_margin`, rounded to 4 places.
pub fn compute_selling_price(
    provider_rate: Decimal,
    fixed_margin: Decimal,
    percent_margin: Decimal,
    custom_price: Option<Decimal>,
) -> Decimal {
    if let Some(custom) = custom_price.filter(|p| *p > Decimal::ZERO) {
        return round_money(custom);
    }

    let margin = provider_rate * percent_margin / Decimal::ONE_HUNDRED;
    round_money(provider_rate + margin + fixed_margin)
}

/// Charge for `quantity` units at `selling_price` per 1000.
pub fn compute_charge(selling_price: Decimal, quantity: u32) -> Money {
    let raw = selling_price * Decimal::from(quantity) / Decimal::from(PRICE_UNIT);
    // Selling prices are validated non-negative when the service is built.
    Money::new(raw).unwrap_or_else(|_| Money::zero())
}
