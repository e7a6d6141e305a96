//! Schoolbook sync layer.
//!
//! Keeps an in-memory working copy of students, employees, fees and expenses
//! consistent with a remote table store: optimistic mutation with rollback,
//! session partitioning, a recycle bin with retention-bounded purge, and a
//! retrying bootstrap that degrades to offline mode.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod reaper;
pub mod session;
pub mod store;
pub mod sync;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bootstrap::{BootstrapLoader, RetryPolicy, StatusHandle};
use gateway::RemoteGateway;
use models::SchoolConfig;
use notify::NotificationLog;
use reaper::TombstoneReaper;
use store::{EntityStore, StoreHandle};
use sync::SyncCoordinator;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: SyncCoordinator,
    pub reaper: TombstoneReaper,
    pub status: StatusHandle,
    pub notifications: NotificationLog,
}

impl AppState {
    /// Wire the sync layer around `gateway`, starting from `initial` settings.
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        initial: SchoolConfig,
        retention: chrono::Duration,
    ) -> Self {
        let store = StoreHandle::new(EntityStore::new(initial));
        let notifications = NotificationLog::default();
        let sink: notify::SharedSink = Arc::new(notifications.clone());

        let coordinator = SyncCoordinator::new(store.clone(), gateway.clone(), sink.clone());
        let reaper = TombstoneReaper::new(store, gateway, sink).with_retention(retention);

        Self {
            coordinator,
            reaper,
            status: StatusHandle::default(),
            notifications,
        }
    }

    /// Loader that fills this state's store and publishes to its status.
    pub fn bootstrap_loader(&self, policy: RetryPolicy) -> BootstrapLoader {
        BootstrapLoader::new(
            self.coordinator.store().clone(),
            self.coordinator.gateway(),
            Arc::new(self.notifications.clone()),
            self.reaper.clone(),
        )
        .with_policy(policy)
        .with_status(self.status.clone())
    }
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // API routes
    let api_routes = Router::new()
        // Datastore
        .route("/datastore", get(api::get_datastore))
        .route("/datastore/revision", get(api::get_revision))
        .route("/status", get(api::get_status))
        // Records
        .route(
            "/records/{collection}",
            get(api::list_records).post(api::create_record),
        )
        .route("/records/{collection}/bin", get(api::list_recycle_bin))
        .route("/records/{collection}/purge", post(api::purge_records))
        .route(
            "/records/{collection}/{id}",
            get(api::get_record)
                .put(api::update_record)
                .delete(api::delete_record),
        )
        .route("/records/{collection}/{id}/restore", post(api::restore_record))
        // Settings
        .route("/config", get(api::get_config).put(api::update_config))
        // Backups
        .route("/backup", get(api::export_backup).post(api::import_backup))
        // Maintenance
        .route("/maintenance/reap", post(api::run_reaper))
        .route("/maintenance/reset", post(api::factory_reset))
        .route(
            "/notifications",
            get(api::list_notifications).delete(api::clear_notifications),
        );

    // Health check
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
