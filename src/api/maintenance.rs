//! Maintenance endpoints: reaper, factory reset and the notification log.

use axum::extract::State;

use super::{error, revision, success, ApiResult};
use crate::models::Notification;
use crate::reaper::ReapReport;
use crate::AppState;

/// POST /api/maintenance/reap - Run the tombstone reaper now.
pub async fn run_reaper(State(state): State<AppState>) -> ApiResult<ReapReport> {
    let report = state.reaper.run().await;
    success(report, revision(&state))
}

/// POST /api/maintenance/reset - Erase every record; settings are kept.
pub async fn factory_reset(State(state): State<AppState>) -> ApiResult<usize> {
    match state.coordinator.factory_reset().await {
        Ok(erased) => success(erased, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}

/// GET /api/notifications - Recent notifications, oldest first.
pub async fn list_notifications(State(state): State<AppState>) -> ApiResult<Vec<Notification>> {
    success(state.notifications.entries(), revision(&state))
}

/// DELETE /api/notifications - Dismiss every notification.
pub async fn clear_notifications(State(state): State<AppState>) -> ApiResult<()> {
    state.notifications.clear();
    success((), revision(&state))
}
