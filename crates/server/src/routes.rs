pub mod config;
pub mod events;
pub mod tasks;
pub mod workspaces;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::AppState;

const MAX_JSON_BODY_BYTES: usize = 1024 * 1024;
const MAX_INSTRUCTIONS_BODY_BYTES: usize = 512 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/api/tasks/{id}",
            get(tasks::fetch).put(tasks::update).delete(tasks::delete),
        )
        .route("/api/tasks/{id}/feedback", post(tasks::feedback))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/tasks/{id}/retry", post(tasks::retry))
        .route("/api/tasks/{id}/resume", post(tasks::resume))
        .route("/api/tasks/{id}/sync", post(tasks::sync))
        .route("/api/tasks/{id}/archive", post(tasks::archive))
        .route("/api/tasks/{id}/events", get(tasks::events))
        .route("/api/tasks/{id}/diff", get(tasks::diff))
        .route("/api/tasks/{id}/logs", get(events::task_logs))
        .route("/api/events", get(events::change_stream))
        .route("/api/config", get(config::fetch).put(config::update))
        .route(
            "/api/workspaces/{name}/instructions",
            get(workspaces::fetch_instructions)
                .put(workspaces::update_instructions)
                .layer(RequestBodyLimitLayer::new(MAX_INSTRUCTIONS_BODY_BYTES)),
        )
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
