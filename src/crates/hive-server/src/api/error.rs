//! API error types and HTTP response conversion.

use crate::error::ServerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub message: String,
}

/// API result type.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// API-layer errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<ServerError> for ApiError {
    fn from(error: ServerError) -> Self {
        match &error {
            ServerError::SessionExists(_) => ApiError::Conflict(error.to_string()),
            ServerError::SessionNotFound(_)
            | ServerError::ExecutionNotFound(_)
            | ServerError::EntryPointNotFound(_)
            | ServerError::GraphNotFound(_)
            | ServerError::CheckpointNotFound(_) => ApiError::NotFound(error.to_string()),
            ServerError::ChatUndeliverable => ApiError::ServiceUnavailable(error.to_string()),
            ServerError::NoWorker(_) | ServerError::NothingToResume => {
                ApiError::BadRequest(error.to_string())
            }
            ServerError::Engine(hive_core::EngineError::Config(_)) => {
                ApiError::BadRequest(error.to_string())
            }
            ServerError::Engine(_) | ServerError::Checkpoint(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(ServerError::SessionExists("s".to_string())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ServerError::SessionNotFound("s".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ServerError::ChatUndeliverable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ServerError::Engine(hive_core::EngineError::Config(
                "bad".to_string()
            )))
            .status(),
            StatusCode::BAD_REQUEST
        );
    }
}
