//! Schoolbook sync host
//!
//! Serves the sync layer to the browser UI, backed by a SQLite remote table store.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use schoolbook_sync::config::Config;
use schoolbook_sync::gateway::SqliteGateway;
use schoolbook_sync::models::SchoolConfig;
use schoolbook_sync::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Schoolbook sync host");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);
    tracing::info!(
        retention_days = config.retention_days,
        default_session = %config.default_session,
        "Sync settings"
    );

    // Open the remote table store
    let gateway = Arc::new(SqliteGateway::open(&config.db_path).await?);

    let state = AppState::new(
        gateway,
        SchoolConfig::with_session(config.default_session.clone()),
        config.retention(),
    );

    // Initial load; runs the reaper once on success
    let status = state.bootstrap_loader(config.retry_policy()).run().await;
    tracing::info!(mode = ?status.mode, attempts = status.attempts, "Bootstrap finished");

    match config.reaper_interval {
        Some(interval) => {
            state.reaper.clone().spawn_periodic(interval);
            tracing::info!("Tombstone reaper scheduled every {:?}", interval);
        }
        None => tracing::warn!("Periodic tombstone reaper disabled"),
    }

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
