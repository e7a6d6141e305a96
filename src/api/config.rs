//! Settings API endpoints.

use axum::{extract::State, Json};

use super::{error, revision, success, ApiResult};
use crate::errors::AppError;
use crate::models::SchoolConfig;
use crate::AppState;

/// GET /api/config - Current school configuration.
pub async fn get_config(State(state): State<AppState>) -> ApiResult<SchoolConfig> {
    let config = state.coordinator.store().read().config().clone();
    success(config, revision(&state))
}

/// PUT /api/config - Save the configuration, including session switches.
pub async fn update_config(
    State(state): State<AppState>,
    Json(config): Json<SchoolConfig>,
) -> ApiResult<SchoolConfig> {
    let revision_id = revision(&state);

    if config.current_session.trim().is_empty() {
        return error(
            AppError::Validation("currentSession is required".to_string()),
            revision_id,
        );
    }

    match state.coordinator.update_config(config).await {
        Ok(config) => success(config, revision(&state)),
        Err(e) => error(e, revision(&state)),
    }
}
