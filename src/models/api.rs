//! JSON request and response bodies for the upload protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{file::FileRecord, session::Progress};

/// Body of `POST /uploads`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_folder: Option<String>,
    /// Preferred chunk size; the server clamps it to its own bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

/// Response to a chunk upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u64,
    pub uploaded_count: u64,
    pub total_chunks: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
}

impl ChunkAck {
    pub fn new(chunk_index: u64, progress: &Progress) -> Self {
        Self {
            chunk_index,
            uploaded_count: progress.uploaded_count,
            total_chunks: progress.total_chunks,
            progress_percent: progress.progress_percent,
            is_complete: progress.is_complete,
        }
    }
}

/// Response to `GET /uploads/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub session_id: String,
    pub uploaded_count: u64,
    pub uploaded_indices: Vec<u64>,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
    pub expires_at: DateTime<Utc>,
}

/// Response to a successful finalize (and to the catalog lookup).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedFile {
    pub file_id: String,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl From<FileRecord> for FinalizedFile {
    fn from(record: FileRecord) -> Self {
        Self {
            file_id: record.id,
            name: record.name,
            size_bytes: record.size_bytes.max(0) as u64,
            mime_type: record.mime_type,
            created_at: record.created_at,
        }
    }
}

/// Body of `POST /folders`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreateFolderRequest {
    pub name: String,
}

/// Error body rendered for every non-2xx response.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u64>>,
}
