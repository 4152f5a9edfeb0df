//! Server-side upload protocol: session registry, chunk ledger, finalizer and
//! reaper, plus the storage and catalog collaborators they drive.

pub mod append_store;
pub mod catalog;
pub mod finalizer;
pub mod ledger;
pub mod reaper;
pub mod registry;
pub mod upload_service;

use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("upload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("missing principal")]
    Unauthenticated,
    #[error("principal is not allowed to access this upload")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("chunk {chunk_index} was already recorded with different content")]
    Conflict { chunk_index: u64 },
    #[error("upload is incomplete: {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u64> },
    #[error("storage append failed: {0}")]
    Upstream(String),
    #[error("storage append timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub fn session_not_found(session_id: &str) -> Self {
        UploadError::NotFound(format!("upload session `{session_id}`"))
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
