//! Upload sessions and the per-chunk ledger rows that back them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;

/// Lifecycle of an upload session.
///
/// `Active` is the only non-terminal state. Both terminal states are reached
/// by a single conditional `UPDATE ... WHERE status = 'active'`, so a session
/// can never be finalized after being reaped or vice versa.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Finalized,
    Expired,
}

/// Server-side record of an in-progress upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque, randomly generated session id (hex).
    pub id: String,

    /// Principal that created the session.
    pub owner_id: String,

    /// Sanitized file name supplied at init.
    pub file_name: String,

    pub mime_type: String,

    /// Declared size of the whole file in bytes.
    pub total_size: i64,

    /// Fixed chunk size for this session; every chunk but the last is exactly this long.
    pub chunk_size: i64,

    pub total_chunks: i64,

    /// Optional destination folder in the file catalog.
    pub folder_id: Option<String>,

    /// Unique name of the object the append store assembles.
    pub storage_name: String,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    pub status: SessionStatus,
}

impl UploadSession {
    /// Byte offset of `chunk_index` within the assembled object.
    pub fn chunk_offset(&self, chunk_index: i64) -> i64 {
        chunk_index * self.chunk_size
    }

    /// Expected byte length of `chunk_index`; the last chunk carries the remainder.
    pub fn expected_chunk_len(&self, chunk_index: i64) -> i64 {
        let offset = self.chunk_offset(chunk_index);
        (self.total_size - offset).clamp(0, self.chunk_size)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Number of chunks needed to cover `total_size` bytes.
///
/// An empty file still occupies one (zero-length) chunk so that finalize has
/// a ledger row to verify.
pub fn total_chunks_for(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size).max(1)
}

/// A received chunk, unique per `(session_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkRecord {
    pub session_id: String,

    pub chunk_index: i64,

    pub size_bytes: i64,

    /// Hex MD5 of the chunk payload, used to detect conflicting retransmits.
    pub checksum: String,

    pub recorded_at: DateTime<Utc>,

    /// False while the request that claimed the index is still appending.
    pub committed: bool,
}

/// Progress recomputed from ledger rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub uploaded_count: u64,
    pub uploaded_indices: Vec<u64>,
    pub total_chunks: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
}

impl Progress {
    /// Build progress from the distinct recorded indices (ascending).
    ///
    /// Completeness requires the index set to be exactly `0..total_chunks`;
    /// a matching count with an out-of-range index does not qualify.
    pub fn from_indices(uploaded_indices: Vec<u64>, total_chunks: u64) -> Self {
        let uploaded_count = uploaded_indices.len() as u64;
        let is_complete = uploaded_count == total_chunks
            && uploaded_indices
                .iter()
                .enumerate()
                .all(|(pos, idx)| *idx == pos as u64);
        let progress_percent = if total_chunks == 0 {
            0.0
        } else {
            ((uploaded_count as f64 * 100.0 / total_chunks as f64) * 100.0).round() / 100.0
        };
        Self {
            uploaded_count,
            uploaded_indices,
            total_chunks,
            progress_percent,
            is_complete,
        }
    }

    /// Indices in `0..total_chunks` that have not been recorded yet.
    pub fn missing(&self) -> Vec<u64> {
        let recorded: BTreeSet<u64> = self.uploaded_indices.iter().copied().collect();
        (0..self.total_chunks)
            .filter(|idx| !recorded.contains(idx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks_for(12 * 1024 * 1024, 5 * 1024 * 1024), 3);
        assert_eq!(total_chunks_for(10, 5), 2);
        assert_eq!(total_chunks_for(11, 5), 3);
        assert_eq!(total_chunks_for(0, 5), 1);
    }

    #[test]
    fn completeness_requires_exact_index_set() {
        let progress = Progress::from_indices(vec![0, 1, 3], 3);
        assert_eq!(progress.uploaded_count, 3);
        assert!(!progress.is_complete);
        assert_eq!(progress.missing(), vec![2]);

        let progress = Progress::from_indices(vec![0, 1, 2], 3);
        assert!(progress.is_complete);
        assert!(progress.missing().is_empty());
        assert_eq!(progress.progress_percent, 100.0);
    }

    #[test]
    fn missing_lists_set_difference() {
        let progress = Progress::from_indices(vec![0, 2, 3, 5, 6, 8, 9], 10);
        assert_eq!(progress.missing(), vec![1, 4, 7]);
        assert_eq!(progress.progress_percent, 70.0);
    }

    #[test]
    fn last_chunk_carries_remainder() {
        let now = Utc::now();
        let session = UploadSession {
            id: "s".into(),
            owner_id: "o".into(),
            file_name: "f.bin".into(),
            mime_type: "application/octet-stream".into(),
            total_size: 12,
            chunk_size: 5,
            total_chunks: 3,
            folder_id: None,
            storage_name: "x".into(),
            created_at: now,
            expires_at: now,
            status: SessionStatus::Active,
        };
        assert_eq!(session.expected_chunk_len(0), 5);
        assert_eq!(session.expected_chunk_len(2), 2);
        assert_eq!(session.chunk_offset(2), 10);
    }
}
