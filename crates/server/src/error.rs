use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sandbox::SandboxError;
use services::services::ServiceError;
use store::StoreError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("agent credentials missing")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("too many subscriptions")]
    TooManySubscribers,
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        StoreError::Io(_) | StoreError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(err) => store_status(err),
            ApiError::Service(err) => match err {
                ServiceError::Store(inner) => store_status(inner),
                ServiceError::InvalidState(_) => StatusCode::BAD_REQUEST,
                ServiceError::Conflict(_) => StatusCode::CONFLICT,
                ServiceError::Sandbox(SandboxError::Terminated) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                ServiceError::Worktree(_)
                | ServiceError::Git(_)
                | ServiceError::Sandbox(_)
                | ServiceError::Io(_)
                | ServiceError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManySubscribers => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx detail stays in the log; the browser gets a redacted message.
        let message = if status.is_server_error() {
            tracing::error!("request failed: {self}");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = ApiResponse::<()>::error(&message);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_kind_to_status_mapping() {
        assert_eq!(
            ApiError::Store(StoreError::NotFound(Uuid::new_v4())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Store(StoreError::InvalidArgument("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Service(ServiceError::Conflict("rebase".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Service(ServiceError::InvalidState("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::TooManySubscribers.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Service(ServiceError::Join("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
