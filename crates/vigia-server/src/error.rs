//! Mapping from domain errors to HTTP responses.
//!
//! The response body reuses the stable kind codes the job log and
//! snapshots already speak, so an operator can grep one vocabulary across
//! API responses and the database.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use vigia_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so route handlers can `?` straight out of repository and queue
/// calls.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status for this failure. Only the non-retryable validation
    /// kinds are the caller's fault; a timeout maps to the gateway class,
    /// and the rest stays a plain 500.
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::ValidationFailed(_) | AppError::SerializationError(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        respond(
            self.status(),
            self.0.kind_code(),
            self.0.to_string(),
        )
    }
}

/// The one rejection the auth layer produces.
pub fn unauthorized() -> Response {
    respond(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "This endpoint requires `Authorization: Bearer` with the service secret".to_string(),
    )
}

fn respond(status: StatusCode, error: &str, message: String) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message,
    };
    (status, axum::Json(body)).into_response()
}
