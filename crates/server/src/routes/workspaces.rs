use axum::{
    Json,
    extract::{Path, State},
    response::Json as ResponseJson,
};
use serde::{Deserialize, Serialize};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Serialize)]
pub struct InstructionsBody {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstructions {
    pub content: String,
}

pub async fn fetch_instructions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<ResponseJson<ApiResponse<InstructionsBody>>, ApiError> {
    let content = state.instructions.read(&name)?;
    Ok(ResponseJson(ApiResponse::success(InstructionsBody { content })))
}

pub async fn update_instructions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateInstructions>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.instructions.write(&name, &req.content)?;
    Ok(ResponseJson(ApiResponse::success(())))
}
