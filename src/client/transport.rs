//! Client side of the upload protocol.
//!
//! The scheduler talks to the server only through [`ChunkTransport`], which
//! keeps it independent of HTTP and lets tests drive it in-process.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::{
    auth::{PRINCIPAL_HEADER, ROLE_HEADER},
    models::api::{
        ChunkAck, ErrorBody, FinalizedFile, InitUploadRequest, InitUploadResponse, UploadStatus,
    },
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server storage error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("chunk conflict: {0}")]
    Conflict(String),
    #[error("upload incomplete, {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u64> },
    #[error("could not decode server response: {0}")]
    Decode(String),
}

impl TransferError {
    /// Transient failures worth retrying for the same chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout | TransferError::Network(_) | TransferError::Upstream { .. }
        )
    }
}

#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError>;

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        bytes: Bytes,
    ) -> Result<ChunkAck, TransferError>;

    async fn status(&self, session_id: &str) -> Result<UploadStatus, TransferError>;

    async fn finalize(&self, session_id: &str) -> Result<FinalizedFile, TransferError>;

    /// File already created from `session_id`, if any.
    async fn lookup_file(&self, session_id: &str) -> Result<Option<FinalizedFile>, TransferError>;
}

/// reqwest-backed transport speaking the JSON/HTTP protocol.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    principal: String,
    admin: bool,
}

impl HttpTransport {
    /// `timeout` bounds every request, including chunk bodies.
    pub fn new(
        base_url: impl Into<String>,
        principal: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            principal: principal.into(),
            admin: false,
        })
    }

    pub fn with_admin_role(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(PRINCIPAL_HEADER, &self.principal);
        if self.admin {
            builder.header(ROLE_HEADER, "admin")
        } else {
            builder
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, TransferError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                if e.is_timeout() {
                    TransferError::Timeout
                } else {
                    TransferError::Decode(e.to_string())
                }
            });
        }

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text).ok();
        Err(error_from_response(status, body, text))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransferError {
    if err.is_timeout() {
        TransferError::Timeout
    } else {
        TransferError::Network(err.to_string())
    }
}

pub(crate) fn error_from_response(status: StatusCode, body: Option<ErrorBody>, raw: String) -> TransferError {
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or(raw);
    let code = body.as_ref().map(|b| b.code.as_str()).unwrap_or_default();

    match status {
        StatusCode::NOT_FOUND => TransferError::NotFound(message),
        StatusCode::CONFLICT if code == "incomplete_upload" => TransferError::Incomplete {
            missing: body.and_then(|b| b.missing_chunks).unwrap_or_default(),
        },
        StatusCode::CONFLICT => TransferError::Conflict(message),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => TransferError::Timeout,
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            TransferError::Upstream {
                status: s.as_u16(),
                message,
            }
        }
        s => TransferError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn init(&self, req: &InitUploadRequest) -> Result<InitUploadResponse, TransferError> {
        self.execute(self.client.post(self.url("/uploads")).json(req))
            .await
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        bytes: Bytes,
    ) -> Result<ChunkAck, TransferError> {
        let url = self.url(&format!("/uploads/{session_id}/chunks/{chunk_index}"));
        self.execute(
            self.client
                .put(url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        )
        .await
    }

    async fn status(&self, session_id: &str) -> Result<UploadStatus, TransferError> {
        self.execute(self.client.get(self.url(&format!("/uploads/{session_id}"))))
            .await
    }

    async fn finalize(&self, session_id: &str) -> Result<FinalizedFile, TransferError> {
        self.execute(
            self.client
                .post(self.url(&format!("/uploads/{session_id}/finalize"))),
        )
        .await
    }

    async fn lookup_file(&self, session_id: &str) -> Result<Option<FinalizedFile>, TransferError> {
        match self
            .execute(
                self.client
                    .get(self.url(&format!("/uploads/{session_id}/file"))),
            )
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(TransferError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: &str, missing: Option<Vec<u64>>) -> Option<ErrorBody> {
        Some(ErrorBody {
            error: "boom".into(),
            status: 409,
            code: code.into(),
            missing_chunks: missing,
        })
    }

    #[test]
    fn maps_status_codes_to_transfer_errors() {
        let err = error_from_response(
            StatusCode::CONFLICT,
            body("incomplete_upload", Some(vec![1, 4])),
            String::new(),
        );
        assert!(matches!(err, TransferError::Incomplete { ref missing } if missing == &[1, 4]));

        let err = error_from_response(StatusCode::CONFLICT, body("chunk_conflict", None), String::new());
        assert!(matches!(err, TransferError::Conflict(_)));
        assert!(!err.is_retryable());

        let err = error_from_response(StatusCode::BAD_GATEWAY, None, "bad gateway".into());
        assert!(err.is_retryable());

        assert!(error_from_response(StatusCode::GATEWAY_TIMEOUT, None, String::new()).is_retryable());

        let err = error_from_response(StatusCode::FORBIDDEN, None, "nope".into());
        assert!(matches!(err, TransferError::Rejected { status: 403, .. }));
        assert!(!err.is_retryable());

        let err = error_from_response(StatusCode::NOT_FOUND, None, "gone".into());
        assert!(matches!(err, TransferError::NotFound(_)));
    }
}
