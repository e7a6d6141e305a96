//! Error handling for the sync layer.
//!
//! Remote failures arrive as raw text and are classified exactly once, in
//! [`classify_remote_error`]. Everything else in the crate matches on
//! [`RemoteErrorKind`] instead of inspecting message text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONFLICT: &str = "CONFLICT";
    pub const POLICY_DENIED: &str = "POLICY_DENIED";
    pub const SCHEMA_MISMATCH: &str = "SCHEMA_MISMATCH";
    pub const REMOTE_UNAVAILABLE: &str = "REMOTE_UNAVAILABLE";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// Substrings that identify a remote access-control rejection.
const POLICY_MARKERS: &[&str] = &[
    "row-level security",
    "row level security",
    "security policy",
    "violates row",
    "permission denied",
    "not authorized",
];

/// Substrings that identify a missing column or table on the remote side.
const SCHEMA_MARKERS: &[&str] = &[
    "no such column",
    "no such table",
    "could not find the",
    "schema cache",
    "has no column named",
];

/// Error reported by a remote gateway. Carries the raw store message only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        classify_remote_error(&self.message)
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::new(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::new(format!("Malformed row payload: {}", err))
    }
}

/// Class of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteErrorKind {
    /// Network or availability problem; safe to retry.
    Transient,
    /// Access-control rejection; needs an administrator.
    PolicyDenied,
    /// A column or table the layer relies on is missing.
    SchemaMismatch,
}

/// Classify raw remote error text.
pub fn classify_remote_error(text: &str) -> RemoteErrorKind {
    let lower = text.to_lowercase();
    if POLICY_MARKERS.iter().any(|m| lower.contains(m)) {
        RemoteErrorKind::PolicyDenied
    } else if SCHEMA_MARKERS.iter().any(|m| lower.contains(m))
        || (lower.contains("column") && lower.contains("does not exist"))
    {
        RemoteErrorKind::SchemaMismatch
    } else {
        RemoteErrorKind::Transient
    }
}

/// Errors returned by sync layer operations.
///
/// Remote variants have already been reported through the notification sink
/// by the time the caller sees them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Record {id} already exists in {collection}")]
    DuplicateId { collection: String, id: String },
    #[error("Record {id} not found in {collection}")]
    NotFound { collection: String, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("Field '{0}' is managed by the sync layer and cannot be set directly")]
    ReservedField(String),
    #[error("Import rejected: {0}")]
    InvalidImport(String),
    #[error("Remote store error ({kind:?}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        SyncError::Remote {
            kind: err.kind(),
            message: err.message,
        }
    }
}

/// Startup configuration error.
#[derive(Debug, Error)]
#[error("Invalid {name}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub reason: String,
}

/// HTTP-facing error type for the host API.
#[derive(Debug)]
pub enum AppError {
    /// Resource not found
    NotFound(String),
    /// Validation error
    Validation(String),
    /// Conflicting state (duplicate id, already deleted, ...)
    Conflict(String),
    /// Remote store rejected the operation
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },
    /// Bad request
    BadRequest(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Remote { kind, .. } => match kind {
                RemoteErrorKind::PolicyDenied => StatusCode::FORBIDDEN,
                RemoteErrorKind::SchemaMismatch => StatusCode::INTERNAL_SERVER_ERROR,
                RemoteErrorKind::Transient => StatusCode::BAD_GATEWAY,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Remote { kind, .. } => match kind {
                RemoteErrorKind::PolicyDenied => codes::POLICY_DENIED,
                RemoteErrorKind::SchemaMismatch => codes::SCHEMA_MISMATCH,
                RemoteErrorKind::Transient => codes::REMOTE_UNAVAILABLE,
            },
            AppError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::NotFound(msg) => msg.clone(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::Remote { message, .. } => message.clone(),
            AppError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::NotFound { .. } => AppError::NotFound(message),
            SyncError::DuplicateId { .. } | SyncError::InvalidState(_) => {
                AppError::Conflict(message)
            }
            SyncError::ReservedField(_) | SyncError::InvalidImport(_) => {
                AppError::Validation(message)
            }
            SyncError::Remote { kind, message } => AppError::Remote { kind, message },
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
    pub revision_id: u64,
}

impl ErrorResponse {
    pub fn new(error: &AppError, revision_id: u64) -> Self {
        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
            },
            revision_id,
        }
    }
}

/// Wrapper type for errors that carry revision_id context.
pub struct AppErrorWithRevision {
    pub error: AppError,
    pub revision_id: u64,
}

impl IntoResponse for AppErrorWithRevision {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = ErrorResponse::new(&self.error, self.revision_id);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_policy_denial() {
        assert_eq!(
            classify_remote_error("new row violates row-level security policy for table \"fees\""),
            RemoteErrorKind::PolicyDenied
        );
        assert_eq!(
            classify_remote_error("Permission denied for table students"),
            RemoteErrorKind::PolicyDenied
        );
    }

    #[test]
    fn test_classify_schema_mismatch() {
        assert_eq!(
            classify_remote_error("no such column: deleted_at"),
            RemoteErrorKind::SchemaMismatch
        );
        assert_eq!(
            classify_remote_error("column \"isDeleted\" does not exist"),
            RemoteErrorKind::SchemaMismatch
        );
        assert_eq!(
            classify_remote_error("Could not find the 'deletedAt' column of 'fees' in the schema cache"),
            RemoteErrorKind::SchemaMismatch
        );
    }

    #[test]
    fn test_classify_everything_else_transient() {
        assert_eq!(classify_remote_error("Failed to fetch"), RemoteErrorKind::Transient);
        assert_eq!(classify_remote_error(""), RemoteErrorKind::Transient);
    }

    #[test]
    fn test_sync_error_maps_to_http_status() {
        let err: AppError = SyncError::Remote {
            kind: RemoteErrorKind::PolicyDenied,
            message: "denied".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.error_code(), codes::POLICY_DENIED);

        let err: AppError = SyncError::NotFound {
            collection: "fees".into(),
            id: "F1".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
