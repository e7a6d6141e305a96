//! Datastore API endpoints: snapshot, revision, sync status and backups.

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

use super::{error, revision, success, ApiResult};
use crate::bootstrap::SyncStatus;
use crate::errors::AppErrorWithRevision;
use crate::models::{Datastore, RevisionInfo};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub records: usize,
}

/// GET /api/datastore - Get the full working copy.
pub async fn get_datastore(State(state): State<AppState>) -> ApiResult<Datastore> {
    let datastore = state.coordinator.store().read().snapshot();
    let revision_id = datastore.revision_id;
    success(datastore, revision_id)
}

/// GET /api/datastore/revision - Get the current revision info.
pub async fn get_revision(State(state): State<AppState>) -> ApiResult<RevisionInfo> {
    let revision_info = state.coordinator.store().read().revision_info();
    let revision_id = revision_info.revision_id;
    success(revision_info, revision_id)
}

/// GET /api/status - Online/offline mode and the diagnostic banner.
pub async fn get_status(State(state): State<AppState>) -> ApiResult<SyncStatus> {
    success(state.status.get(), revision(&state))
}

/// GET /api/backup - Download the working copy as a backup document.
pub async fn export_backup(State(state): State<AppState>) -> Result<Response, AppErrorWithRevision> {
    let revision_id = revision(&state);
    let body = state
        .coordinator
        .export_backup()
        .map_err(|e| AppErrorWithRevision {
            error: e.into(),
            revision_id,
        })?;

    let disposition = format!(
        "attachment; filename=\"schoolbook-backup-{}.json\"",
        Utc::now().format("%Y-%m-%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// POST /api/backup - Replace everything with an uploaded backup document.
pub async fn import_backup(State(state): State<AppState>, body: String) -> ApiResult<ImportSummary> {
    match state.coordinator.import_backup(&body).await {
        Ok(records) => success(ImportSummary { records }, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}
