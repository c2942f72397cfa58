//! switchyard server.
//!
//! Wires the credential vault to Postgres, serves the management API and runs
//! the health monitor. [`run`] is the whole process: any failure before the
//! listener is up means the vault refuses to start.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;

use crate::config::ServerConfig;
use crate::db::{PgAuditLog, PgCredentialStore, PgIntegrationStore};
use crate::error::StartupError;
use crate::routes::AppState;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::sync::Arc;
use switchyard_integration::connectors::register_bundled;
use switchyard_integration::{
    Cipher, ConnectorDispatch, IntegrationRegistry, KeyRing, LifecycleController, SecretStore,
};
use switchyard_scheduler::HealthMonitor;
use tracing::{error, info};

/// Loads configuration from the environment and serves until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the process cannot start or the server fails.
pub async fn run() -> switchyard_core::Result<(), StartupError> {
    let config = ServerConfig::from_env().map_err(|e| StartupError::Config {
        reason: e.to_string(),
    })?;
    info!("Loaded configuration");
    serve(config, shutdown_signal()).await
}

/// Starts every component and serves until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if any startup step fails or the server stops with an
/// error.
pub async fn serve(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> switchyard_core::Result<(), StartupError> {
    let ring = KeyRing::from_config(&config.vault).map_err(|e| StartupError::KeyRing {
        reason: e.to_string(),
    })?;
    info!(active = %ring.active_version(), versions = ring.versions().len(), "Key ring ready");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Database {
            reason: e.to_string(),
        })?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StartupError::Migration {
            reason: e.to_string(),
        })?;

    let secrets = SecretStore::new(
        Arc::new(ring),
        Arc::new(PgCredentialStore::new(pool.clone())),
    );
    if config.vault.rewrap_on_start {
        let summary = secrets
            .rewrap_stale()
            .await
            .map_err(|e| StartupError::Rewrap {
                reason: e.to_string(),
            })?;
        info!(
            rewrapped = summary.rewrapped,
            skipped = summary.skipped,
            "Re-wrapped stale credentials"
        );
    }

    let registry = IntegrationRegistry::new(
        Arc::new(PgIntegrationStore::new(pool.clone())),
        secrets,
        Arc::new(PgAuditLog::new(pool)),
    );
    let dispatch = Arc::new(ConnectorDispatch::new());
    register_bundled(&dispatch);
    let controller = LifecycleController::new(registry, dispatch, config.lifecycle);

    let monitor = HealthMonitor::new(controller.clone(), config.health).map_err(|e| {
        StartupError::Monitor {
            reason: e.current_context().to_string(),
        }
    })?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: config.listen_addr.clone(),
            reason: e.to_string(),
        })?;
    let monitor = monitor.spawn();

    info!("listening on http://{}", config.listen_addr);
    let served = axum::serve(listener, routes::router(AppState { controller }))
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Waiting for the health monitor to finish its tick");
    monitor.shutdown().await;

    served.map_err(|e| {
        StartupError::Serve {
            reason: e.to_string(),
        }
        .into()
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
