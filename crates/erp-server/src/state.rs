use std::sync::Arc;

use erp_ledger::Ledger;
use erp_store::InMemoryStore;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Shared state behind every handler.
pub struct AppState {
    pub ledger: Ledger<InMemoryStore>,
}

impl AppState {
    pub fn new(ledger: Ledger<InMemoryStore>) -> Self {
        Self { ledger }
    }

    /// Build the ledger described by `config`, seeding the store from its
    /// snapshot if one is named.
    pub fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        let store = match &config.snapshot {
            Some(path) => InMemoryStore::load_snapshot(path)?,
            None => InMemoryStore::new(),
        };
        let clock = config
            .ledger
            .clock()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let ledger = Ledger::new(store, config.ledger.clone(), Arc::new(clock));
        Ok(Self::new(ledger))
    }
}

pub type SharedState = Arc<AppState>;
