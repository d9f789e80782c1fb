use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use erp_ledger::LedgerConfig;

use crate::error::{ServerError, ServerResult};

/// Environment variable that overrides [`ServerConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "ERP_BIND_ADDR";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// JSON snapshot to seed the in-memory store from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
    pub ledger: LedgerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8640)),
            snapshot: None,
            ledger: LedgerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ServerResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
    }

    /// [`ServerConfig::load`] followed by environment overrides.
    pub fn load_with_env(path: &Path) -> ServerResult<Self> {
        let mut config = Self::load(path)?;
        config.override_bind_addr(std::env::var(BIND_ADDR_ENV).ok().as_deref())?;
        Ok(config)
    }

    pub fn override_bind_addr(&mut self, value: Option<&str>) -> ServerResult<()> {
        if let Some(value) = value {
            self.bind_addr = value
                .parse()
                .map_err(|e| ServerError::Config(format!("{BIND_ADDR_ENV}={value}: {e}")))?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }
}
