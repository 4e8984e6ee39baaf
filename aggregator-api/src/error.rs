use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Request-level failures. Per-item outcomes of a batch are reported in the publish response
/// instead.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request body must be an event object or an array of events")]
    InvalidBody,
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch of {size} events exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("{0}")]
    StoreUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidJson(_)
            | ApiError::InvalidBody
            | ApiError::EmptyBatch
            | ApiError::BatchTooLarge { .. } => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable(_) => {
                error!("{}", self);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
