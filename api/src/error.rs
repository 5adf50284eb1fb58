use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use storage::StorageError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object not found: {0}")]
    NoSuchKey(String),

    #[error("Replication task not found: {0}")]
    NoSuchTask(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => ApiError::NoSuchKey(key),
            StorageError::ChecksumMismatch { expected, actual } => {
                ApiError::ChecksumMismatch { expected, actual }
            }
            other => ApiError::Storage(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "StorageError"),
            ApiError::NoSuchKey(_) => (StatusCode::NOT_FOUND, "NoSuchKey"),
            ApiError::NoSuchTask(_) => (StatusCode::NOT_FOUND, "NoSuchTask"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ApiError::ChecksumMismatch { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "ChecksumMismatch"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let body = Json(json!({
            "code": code,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
