use axum::{Json, extract::State, response::Json as ResponseJson};
use services::services::{
    config::ConfigView,
    env_file::{EnvFileUpdate, apply_update, env_file_path},
};
use store::StoreError;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

pub async fn fetch(State(state): State<AppState>) -> ResponseJson<ApiResponse<ConfigView>> {
    ResponseJson(ApiResponse::success(state.config.masked_view()))
}

/// The env-file updater contract: empty string is "no change" for secrets
/// and "clear" for non-secret fields. Takes effect for every container
/// launched afterwards.
pub async fn update(
    State(state): State<AppState>,
    Json(req): Json<EnvFileUpdate>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let path = state
        .env_file
        .clone()
        .unwrap_or_else(|| env_file_path(&state.config));
    apply_update(&path, req).map_err(|e| ApiError::Store(StoreError::Io(e)))?;
    Ok(ResponseJson(ApiResponse::success(())))
}
