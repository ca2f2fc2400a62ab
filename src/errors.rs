use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

/// Failures of the geocoding/routing and distance cache layer.
///
/// Only `TransientService` is retried by [`crate::services::retry::RetryPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum DistanceError {
    /// Geocoding returned no match for a place name.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limiting, timeouts and upstream 5xx responses.
    #[error("Transient service error: {0}")]
    TransientService(String),

    /// Bad input, unexpected 4xx responses or malformed payloads.
    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl DistanceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DistanceError::TransientService(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ExternalServiceError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal database error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<DistanceError> for AppError {
    fn from(err: DistanceError) -> Self {
        match err {
            DistanceError::NotFound(msg) => AppError::NotFound(msg),
            DistanceError::Permanent(msg) => AppError::BadRequest(msg),
            DistanceError::TransientService(msg) => AppError::ExternalServiceError(msg),
            DistanceError::Storage(e) => AppError::DatabaseError(e),
            DistanceError::Cancelled => AppError::InternalError("Operation cancelled".to_string()),
        }
    }
}
