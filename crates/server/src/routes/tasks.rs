use axum::{
    Json,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
};
use serde::Deserialize;
use services::services::{diff as diff_service, lifecycle::UpdateTaskRequest};
use store::models::{CreateTask, Task, TaskEvent};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub fresh_start: bool,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub archived: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ResponseJson<ApiResponse<Vec<Task>>> {
    ResponseJson(ApiResponse::success(
        state.store.list_tasks(query.include_archived),
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.create_task(req)?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(state.store.get_task(id)?)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    use store::models::TaskStatus;
    // Starting a run without credentials would only produce a failed
    // container; refuse up front.
    if req.status == Some(TaskStatus::InProgress)
        && state.config.oauth_token.is_none()
        && state.config.api_key.is_none()
    {
        return Err(ApiError::Unauthorized);
    }
    let task = state.lifecycle.update_task(id, req).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.lifecycle.delete_task(id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FeedbackRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.feedback(id, req.message).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.cancel_task(id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RetryRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.retry_task(id, req.fresh_start).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.resume_task(id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.sync_task(id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ArchiveRequest>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = state.lifecycle.set_archived(id, req.archived)?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskEvent>>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(state.store.get_events(id)?)))
}

/// Live worktree diff while the task has worktrees; reconstructed from the
/// recorded commit hashes afterwards.
pub async fn diff(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<diff_service::WorkspaceDiff>>>, ApiError> {
    let diffs =
        diff_service::task_diffs(state.store.clone(), state.worktrees.clone(), id).await?;
    Ok(ResponseJson(ApiResponse::success(diffs)))
}
