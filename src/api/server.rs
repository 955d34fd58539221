//! API Server
//!
//! Runs the REST server with graceful shutdown.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;
use crate::scheduler::Vdqm;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Allow cross-origin requests from operator dashboards
    pub permissive_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            permissive_cors: false,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    vdqm: Arc<Vdqm>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, vdqm: Arc<Vdqm>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            vdqm,
            shutdown_tx,
        }
    }

    /// Serve until [`Self::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut router = RestRouter::new(self.vdqm.clone())
            .build()
            .layer(TraceLayer::new_for_http());
        if self.config.permissive_cors {
            router = router.layer(CorsLayer::permissive());
        }

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::orchestrator::tests::vdqm_with;
    use crate::scheduler::worker::tests::RecordingDaemon;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert!(!config.permissive_cors);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let server = Arc::new(ApiServer::new(
            ApiServerConfig {
                rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                permissive_cors: true,
            },
            vdqm,
        ));

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
