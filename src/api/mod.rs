//! REST API module.
//!
//! Exposes the sync layer to the browser UI. Every response carries the
//! Entity Store revision so the UI can tell whether its copy is stale.

mod config;
mod datastore;
mod maintenance;
mod records;

pub use config::*;
pub use datastore::*;
pub use maintenance::*;
pub use records::*;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::errors::{AppError, AppErrorWithRevision};
use crate::models::Collection;
use crate::AppState;

/// Success response envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub revision_id: u64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T, revision_id: u64) -> Self {
        Self {
            success: true,
            data,
            revision_id,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Response type that can be either success or error.
pub type ApiResult<T> = Result<ApiResponse<T>, AppErrorWithRevision>;

/// Create a successful API response.
pub fn success<T: Serialize>(data: T, revision_id: u64) -> ApiResult<T> {
    Ok(ApiResponse::new(data, revision_id))
}

/// Create an error API response.
pub fn error<T: Serialize>(err: impl Into<AppError>, revision_id: u64) -> ApiResult<T> {
    Err(AppErrorWithRevision {
        error: err.into(),
        revision_id,
    })
}

/// Current Entity Store revision.
fn revision(state: &AppState) -> u64 {
    state.coordinator.store().read().revision()
}

/// Resolve a collection path segment.
fn parse_collection(raw: &str, revision_id: u64) -> Result<Collection, AppErrorWithRevision> {
    raw.parse().map_err(|e: String| AppErrorWithRevision {
        error: AppError::NotFound(e),
        revision_id,
    })
}
