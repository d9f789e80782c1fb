use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use erp_types::{SystemClock, TypeError, MONEY_EPSILON};

/// Business rules that vary between deployments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Days from purchase approval until an AP line falls due.
    pub ap_due_days: u32,
    /// Offset of the business day from UTC, in whole hours.
    pub utc_offset_hours: i32,
    /// Tolerance for every monetary comparison.
    #[serde(with = "rust_decimal::serde::str")]
    pub money_epsilon: Decimal,
    /// Allow stock to go negative for products that do not opt in themselves.
    pub default_allow_negative: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ap_due_days: 30,
            utc_offset_hours: 8,
            money_epsilon: MONEY_EPSILON,
            default_allow_negative: false,
        }
    }
}

impl LedgerConfig {
    /// Wall clock in the configured business time zone.
    pub fn clock(&self) -> Result<SystemClock, TypeError> {
        SystemClock::with_offset_hours(self.utc_offset_hours)
    }
}
