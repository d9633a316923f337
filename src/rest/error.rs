//! API error types and responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::WorkflowError;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found
    NotFound(String),
    /// Validation error
    ValidationError(String),
    /// Resource already exists
    Conflict(String),
    /// Session count or disk quota exhausted
    LimitExceeded(String),
    /// Internal server error
    InternalError(String),
    /// Bad request
    BadRequest(String),
}

/// Error response body
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::LimitExceeded(msg) => {
                (StatusCode::INSUFFICIENT_STORAGE, "limit_exceeded", msg)
            }
            ApiError::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
        };

        if status.is_server_error() {
            tracing::warn!(error, "API request failed: {}", message);
        }

        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            WorkflowError::Validation { ref message, .. } if message.contains("already exists") => {
                ApiError::Conflict(err.to_string())
            }
            WorkflowError::Validation { .. } | WorkflowError::InvalidState { .. } => {
                ApiError::ValidationError(err.to_string())
            }
            WorkflowError::ResourceLimit { .. } => ApiError::LimitExceeded(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_not_found_response() {
        let error = ApiError::from(WorkflowError::not_found("session", "missing-session"));
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.error, "not_found");
        assert!(json.message.contains("missing-session"));
    }

    #[tokio::test]
    async fn test_validation_error_response() {
        let error = ApiError::from(WorkflowError::validation("session_id", "too short"));
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_is_conflict() {
        let error = ApiError::from(WorkflowError::validation(
            "session_id",
            "session 'abc12345' already exists",
        ));
        assert_eq!(error.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_limit_response() {
        let error = ApiError::from(WorkflowError::resource_limit("sessions", "maximum of 1 reached"));
        assert_eq!(error.into_response().status(), StatusCode::INSUFFICIENT_STORAGE);
    }
}
