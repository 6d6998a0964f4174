//! ============================================================================
//! API Errors - MemchatError → HTTP response
//! ============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use memchat_core::MemchatError;

/// Handler error; renders as a JSON body with a matching status
#[derive(Debug)]
pub struct ApiError(pub MemchatError);

impl From<MemchatError> for ApiError {
    fn from(err: MemchatError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            MemchatError::NotFound(what) => (StatusCode::NOT_FOUND, json!({ "detail": what })),
            MemchatError::EmptyInput => (StatusCode::BAD_REQUEST, json!({ "error": "Empty input." })),
            MemchatError::StorageUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg }))
            }
            MemchatError::Generation(msg) => (StatusCode::BAD_GATEWAY, json!({ "error": msg })),
            MemchatError::Configuration(_) | MemchatError::DimensionMismatch { .. } => {
                error!("Request hit a configuration fault: {}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": self.0.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
