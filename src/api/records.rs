//! Record API endpoints, one set per collection.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{error, parse_collection, revision, success, ApiResult};
use crate::errors::AppError;
use crate::models::Record;
use crate::session::{recycle_bin, RecycleBinEntry};
use crate::AppState;

/// Which records a listing returns.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListView {
    /// Live records of the active session.
    #[default]
    Active,
    /// Everything, deleted records and every session included.
    All,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub view: ListView,
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub ids: Vec<String>,
}

/// GET /api/records/:collection - List records.
pub async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Record>> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    let records = match query.view {
        ListView::Active => state.coordinator.active_view(collection),
        ListView::All => state.coordinator.store().read().get(collection),
    };
    success(records, revision_id)
}

/// GET /api/records/:collection/bin - Recycle bin of a collection.
pub async fn list_recycle_bin(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Vec<RecycleBinEntry>> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    let records = state.coordinator.store().read().get(collection);
    let entries = recycle_bin(collection, &records, Utc::now(), state.reaper.retention());
    success(entries, revision_id)
}

/// GET /api/records/:collection/:id - Get a single record.
pub async fn get_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<Record> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    let found = state.coordinator.store().read().find(collection, &id);
    match found {
        Some(record) => success(record, revision_id),
        None => error(
            AppError::NotFound(format!("Record {} not found in {}", id, collection)),
            revision_id,
        ),
    }
}

/// POST /api/records/:collection - Create a record in the active session.
pub async fn create_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(fields): Json<Map<String, Value>>,
) -> ApiResult<Record> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    match state.coordinator.create(collection, fields).await {
        Ok(record) => success(record, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}

/// PUT /api/records/:collection/:id - Update fields; `null` removes a field.
pub async fn update_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> ApiResult<Record> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    match state.coordinator.update(collection, &id, fields).await {
        Ok(record) => success(record, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}

/// DELETE /api/records/:collection/:id - Move a record to the recycle bin.
pub async fn delete_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<Record> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    match state.coordinator.soft_delete(collection, &id).await {
        Ok(record) => success(record, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}

/// POST /api/records/:collection/:id/restore - Bring a record back.
pub async fn restore_record(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<Record> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    match state.coordinator.restore(collection, &id).await {
        Ok(record) => success(record, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}

/// POST /api/records/:collection/purge - Delete recycle-bin records forever.
pub async fn purge_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(request): Json<PurgeRequest>,
) -> ApiResult<usize> {
    let revision_id = revision(&state);
    let collection = parse_collection(&collection, revision_id)?;

    if request.ids.is_empty() {
        return error(
            AppError::Validation("No ids provided".to_string()),
            revision_id,
        );
    }

    match state.coordinator.purge(collection, &request.ids).await {
        Ok(purged) => success(purged, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}
