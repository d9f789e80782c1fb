use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::{AppState, SharedState};

/// ERP ledger HTTP server.
pub struct ErpServer {
    config: ServerConfig,
    state: SharedState,
}

impl ErpServer {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let state = Arc::new(AppState::from_config(&config)?);
        Ok(Self { config, state })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(Arc::clone(&self.state))
    }

    /// Start serving requests.
    pub async fn serve(self) -> ServerResult<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!("ERP server listening on {}", self.config.bind_addr);
        axum::serve(listener, app)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erp_store::{Product, RecordStore};
    use rust_decimal_macros::dec;

    #[test]
    fn server_construction() {
        let server = ErpServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.config().bind_addr.port(), 8640);
        let _router = server.router();
    }

    #[test]
    fn snapshot_seeds_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"tables":{"products":[{"id":3,"sku":"P3","name":"Three","stock":4,"avg_cost":"2.5"}]}}"#,
        )
        .unwrap();
        let config = ServerConfig {
            snapshot: Some(path),
            ..ServerConfig::default()
        };
        let server = ErpServer::new(config).unwrap();
        let product: Product = server.state().ledger.store().get(3).unwrap();
        assert_eq!(product.avg_cost, dec!(2.5));
    }

    #[test]
    fn missing_snapshot_fails() {
        let config = ServerConfig {
            snapshot: Some("/nonexistent/snapshot.json".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(ErpServer::new(config), Err(ServerError::Store(_))));
    }
}
