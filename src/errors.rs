use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

use crate::{models::api::ErrorBody, services::UploadError};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub missing_chunks: Option<Vec<u64>>,
}

impl AppError {
    /// Create a new AppError with a specific status, machine-readable code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            missing_chunks: None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            status: self.status.as_u16(),
            code: self.code.to_string(),
            missing_chunks: self.missing_chunks,
        });

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let (status, code) = match &err {
            UploadError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            UploadError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            UploadError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            UploadError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            UploadError::Conflict { .. } => (StatusCode::CONFLICT, "chunk_conflict"),
            UploadError::Incomplete { .. } => (StatusCode::CONFLICT, "incomplete_upload"),
            UploadError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_storage"),
            UploadError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            UploadError::Sqlx(_) | UploadError::Io(_) => {
                tracing::error!(error = %err, "internal error while handling upload request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        let mut app = AppError::new(status, code, err.to_string());
        if let UploadError::Incomplete { missing } = err {
            app.missing_chunks = Some(missing);
        }
        app
    }
}
