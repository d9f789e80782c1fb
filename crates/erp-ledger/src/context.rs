use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use erp_types::BusinessClock;

use crate::config::LedgerConfig;
use crate::locks::AggregateLocks;

/// Everything an engine needs besides the store.
pub struct LedgerContext {
    pub config: LedgerConfig,
    pub clock: Arc<dyn BusinessClock>,
    pub locks: AggregateLocks,
}

impl LedgerContext {
    pub fn new(config: LedgerConfig, clock: Arc<dyn BusinessClock>) -> Self {
        Self {
            config,
            clock,
            locks: AggregateLocks::new(),
        }
    }

    pub fn epsilon(&self) -> Decimal {
        self.config.money_epsilon
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Current business day in the configured offset.
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }
}

impl std::fmt::Debug for LedgerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerContext")
            .field("config", &self.config)
            .field("offset", &self.clock.offset())
            .finish()
    }
}
