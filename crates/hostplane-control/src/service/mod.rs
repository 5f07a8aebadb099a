//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{HostplaneConfig, Listen};
use crate::error::{ControlError, ControlResult};
use crate::orchestrator::SiteOrchestrator;
use crate::provisioner::create_provisioners;
use crate::store::{DeploymentStore, MemoryStore, PostgresStore, SiteStore};

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Database connections
/// - Provisioners
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct HostplaneService {
    config: HostplaneConfig,
    cancel: CancellationToken,
}

impl HostplaneService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: HostplaneConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Create the provisioners
    /// 3. Create the site orchestrator
    /// 4. Start the HTTP API server
    /// 5. Wait for shutdown signal, then for running workflows
    pub async fn run(&self) -> ControlResult<()> {
        let (sites, deployments) = self.create_store().await;
        let provisioners = create_provisioners(&self.config, Arc::clone(&sites))?;

        let orchestrator = Arc::new(SiteOrchestrator::new(
            sites,
            deployments,
            provisioners,
            &self.config,
        ));
        info!("site orchestrator initialised");

        let state = api::AppState {
            orchestrator: Arc::clone(&orchestrator),
        };

        let app = api::router(state)
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.server.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http());

        info!(
            listen = ?self.config.server.listen,
            "control service listening"
        );

        serve_listener(self.config.server.listen.clone(), app, self.cancel.clone()).await?;

        orchestrator.shutdown().await;
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> (Arc<dyn SiteStore>, Arc<dyn DeploymentStore>) {
        let db = &self.config.database;
        let connect = PostgresStore::new(&db.url, db.max_connections);
        match tokio::time::timeout(Duration::from_secs(db.connect_timeout_secs), connect).await {
            Ok(Ok(store)) => {
                info!("connected to PostgreSQL");
                let store = Arc::new(store);
                let sites: Arc<dyn SiteStore> = store.clone();
                (sites, store)
            }
            Ok(Err(e)) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                in_memory()
            }
            Err(_) => {
                warn!(
                    timeout_secs = db.connect_timeout_secs,
                    "PostgreSQL connection timed out, using in-memory store"
                );
                in_memory()
            }
        }
    }
}

fn in_memory() -> (Arc<dyn SiteStore>, Arc<dyn DeploymentStore>) {
    let store = Arc::new(MemoryStore::new());
    let sites: Arc<dyn SiteStore> = store.clone();
    (sites, store)
}

/// Serve an axum router on the given listener with graceful shutdown.
async fn serve_listener(
    listen: Listen,
    app: axum::Router,
    cancel: CancellationToken,
) -> ControlResult<()> {
    match listen {
        Listen::Tcp { addr } => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel))
                .await
                .map_err(|e| ControlError::Config(format!("server error: {e}")))?;
        }
        Listen::Unix { path } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ControlError::Config(format!("failed to create socket dir: {e}"))
                })?;
            }
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    ControlError::Config(format!("failed to remove stale socket: {e}"))
                })?;
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .map_err(|e| ControlError::Config(format!("failed to bind Unix socket: {e}")))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel))
                .await
                .map_err(|e| ControlError::Config(format!("server error: {e}")))?;
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creation() {
        let service = HostplaneService::new(HostplaneConfig::default());
        assert!(!service.cancel.is_cancelled());
    }

    #[test]
    fn service_shutdown() {
        let service = HostplaneService::new(HostplaneConfig::default());
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn unreachable_database_falls_back_to_memory() {
        let mut config = HostplaneConfig::default();
        config.database.url = "postgres://nobody@127.0.0.1:1/none".to_owned();
        config.database.connect_timeout_secs = 2;
        let service = HostplaneService::new(config);

        let (sites, _) = service.create_store().await;
        assert!(sites.ping().await.is_ok());
    }
}
