//! Monetary amounts.
//!
//! Amounts travel with two-decimal precision. Comparisons against balances
//! tolerate a drift of [`MONEY_EPSILON`].

use rust_decimal::{Decimal, RoundingStrategy};

/// Tolerance for every balance and allocation comparison (0.01).
pub const MONEY_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Round to cents, half away from zero.
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
