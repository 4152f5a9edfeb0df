//! Chunk ledger: the durable set of received chunk indices per session.
//!
//! Recording is idempotent. A request first claims the `(session, index)` row
//! with its checksum, and only the claim holder reaches the append store. The
//! row counts toward progress once the append succeeded and the row was
//! committed, and a committed row is never removed while the session lives.
//! Progress is always recomputed from the committed rows rather than from any
//! counter a client could influence.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{
    UploadError, UploadResult,
    append_store::{AppendRequest, AppendStore},
};
use crate::models::session::{ChunkRecord, Progress, SessionStatus, UploadSession};

/// Outcome of claiming a ledger row.
enum Claim {
    /// This request owns the row and must append the bytes.
    Won,
    /// The same bytes are recorded, or being recorded by another request.
    Held,
}

#[derive(Clone)]
pub struct ChunkLedger {
    db: Arc<SqlitePool>,
    store: Arc<dyn AppendStore>,
    append_timeout: Duration,
}

impl ChunkLedger {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn AppendStore>, append_timeout: Duration) -> Self {
        Self {
            db,
            store,
            append_timeout,
        }
    }

    /// Record `bytes` as chunk `chunk_index` of `session`.
    ///
    /// Ordering: claim the row (only while the session is active), bounded
    /// append, then commit the row in a transaction that re-checks the
    /// session. A failed append gives the claim back. The primary key on
    /// `(session_id, chunk_index)` is what serializes concurrent recorders.
    pub async fn record_chunk(
        &self,
        session: &UploadSession,
        chunk_index: u64,
        bytes: Bytes,
    ) -> UploadResult<Progress> {
        let index = i64::try_from(chunk_index)
            .ok()
            .filter(|i| *i < session.total_chunks)
            .ok_or_else(|| {
                UploadError::Validation(format!(
                    "chunk index {chunk_index} outside 0..{}",
                    session.total_chunks
                ))
            })?;

        let expected_len = session.expected_chunk_len(index);
        if bytes.len() as i64 != expected_len {
            return Err(UploadError::Validation(format!(
                "chunk {chunk_index} has {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }

        let checksum = format!("{:x}", md5::compute(&bytes));

        if let Claim::Held = self.claim(session, index, expected_len, &checksum).await? {
            debug!(session_id = %session.id, chunk_index, "chunk already claimed with same bytes, skipping append");
            return self.progress(session).await;
        }

        let request = AppendRequest {
            destination: session.storage_name.clone(),
            bytes,
            owner_id: session.owner_id.clone(),
            chunk_index,
            total_chunks: session.total_chunks as u64,
            offset: session.chunk_offset(index) as u64,
            is_first_chunk: index == 0,
            is_last_chunk: index == session.total_chunks - 1,
        };

        if let Err(err) = self.append(session, request).await {
            self.release_claim(session, index, &checksum).await;
            return Err(err);
        }

        let progress = self.commit(session, index, &checksum).await?;
        debug!(
            session_id = %session.id,
            chunk_index,
            uploaded = progress.uploaded_count,
            total = progress.total_chunks,
            "chunk recorded"
        );
        Ok(progress)
    }

    /// Progress recomputed from the committed ledger rows of `session`.
    pub async fn progress(&self, session: &UploadSession) -> UploadResult<Progress> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM upload_chunks
             WHERE session_id = ? AND committed = 1
             ORDER BY chunk_index ASC",
        )
        .bind(&session.id)
        .fetch_all(&*self.db)
        .await?;

        Ok(Progress::from_indices(
            to_indices(indices),
            session.total_chunks as u64,
        ))
    }

    /// Insert an uncommitted row for `index` if the session is still active.
    ///
    /// An existing row decides the outcome: different bytes are a conflict,
    /// the same bytes need no second append. A claim left uncommitted for
    /// twice the append timeout belongs to a recorder that never finished and
    /// is taken over.
    async fn claim(
        &self,
        session: &UploadSession,
        index: i64,
        size_bytes: i64,
        checksum: &str,
    ) -> UploadResult<Claim> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        // Writing first takes the write lock up front instead of upgrading a read.
        let inserted = sqlx::query(
            "INSERT INTO upload_chunks
                 (session_id, chunk_index, size_bytes, checksum, recorded_at, committed)
             SELECT ?, ?, ?, ?, ?, 0
             WHERE EXISTS (SELECT 1 FROM upload_sessions WHERE id = ? AND status = ?)
             ON CONFLICT(session_id, chunk_index) DO NOTHING",
        )
        .bind(&session.id)
        .bind(index)
        .bind(size_bytes)
        .bind(checksum)
        .bind(now)
        .bind(&session.id)
        .bind(SessionStatus::Active)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(Claim::Won);
        }

        let existing = sqlx::query_as::<_, ChunkRecord>(
            "SELECT session_id, chunk_index, size_bytes, checksum, recorded_at, committed
             FROM upload_chunks WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(&session.id)
        .bind(index)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(existing) = existing else {
            tx.rollback().await?;
            debug!(session_id = %session.id, chunk_index = index, "session no longer active, chunk refused");
            return Err(UploadError::session_not_found(&session.id));
        };

        if !existing.committed && self.is_abandoned(existing.recorded_at, now) {
            sqlx::query(
                "UPDATE upload_chunks SET checksum = ?, size_bytes = ?, recorded_at = ?
                 WHERE session_id = ? AND chunk_index = ? AND committed = 0",
            )
            .bind(checksum)
            .bind(size_bytes)
            .bind(now)
            .bind(&session.id)
            .bind(index)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            warn!(session_id = %session.id, chunk_index = index, "taking over abandoned chunk claim");
            return Ok(Claim::Won);
        }

        tx.rollback().await?;
        if existing.checksum != checksum {
            warn!(
                session_id = %session.id,
                chunk_index = index,
                committed = existing.committed,
                "duplicate chunk with different content"
            );
            return Err(UploadError::Conflict {
                chunk_index: index as u64,
            });
        }
        Ok(Claim::Held)
    }

    fn is_abandoned(&self, claimed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.append_timeout.saturating_mul(2))
            .ok()
            .and_then(|grace| claimed_at.checked_add_signed(grace))
            .is_some_and(|deadline| deadline <= now)
    }

    async fn append(&self, session: &UploadSession, request: AppendRequest) -> UploadResult<()> {
        let chunk_index = request.chunk_index;
        match tokio::time::timeout(self.append_timeout, self.store.append(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(session_id = %session.id, chunk_index, error = %err, "storage append failed");
                Err(UploadError::Upstream(err.to_string()))
            }
            Err(_) => {
                warn!(session_id = %session.id, chunk_index, "storage append timed out");
                Err(UploadError::Timeout(self.append_timeout))
            }
        }
    }

    /// Drop our uncommitted row so the index can be claimed again.
    async fn release_claim(&self, session: &UploadSession, index: i64, checksum: &str) {
        let released = sqlx::query(
            "DELETE FROM upload_chunks
             WHERE session_id = ? AND chunk_index = ? AND checksum = ? AND committed = 0",
        )
        .bind(&session.id)
        .bind(index)
        .bind(checksum)
        .execute(&*self.db)
        .await;

        if let Err(err) = released {
            // the claim expires on its own after twice the append timeout
            warn!(session_id = %session.id, chunk_index = index, error = %err, "failed to release chunk claim");
        }
    }

    /// Mark our row committed and read back the index set, or find out why not.
    async fn commit(
        &self,
        session: &UploadSession,
        index: i64,
        checksum: &str,
    ) -> UploadResult<Progress> {
        let mut tx = self.db.begin().await?;

        let committed = sqlx::query(
            "UPDATE upload_chunks SET committed = 1
             WHERE session_id = ? AND chunk_index = ? AND checksum = ?
               AND EXISTS (SELECT 1 FROM upload_sessions WHERE id = ? AND status = ?)",
        )
        .bind(&session.id)
        .bind(index)
        .bind(checksum)
        .bind(&session.id)
        .bind(SessionStatus::Active)
        .execute(&mut *tx)
        .await?;

        if committed.rows_affected() == 0 {
            return self.commit_refused(tx, session, index).await;
        }

        let indices = committed_indices(&mut tx, &session.id).await?;
        tx.commit().await?;

        Ok(Progress::from_indices(indices, session.total_chunks as u64))
    }

    async fn commit_refused(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        session: &UploadSession,
        index: i64,
    ) -> UploadResult<Progress> {
        let status: Option<SessionStatus> =
            sqlx::query_scalar("SELECT status FROM upload_sessions WHERE id = ?")
                .bind(&session.id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;

        match status {
            Some(SessionStatus::Active) => {
                // another recorder took the claim over while we were appending
                warn!(session_id = %session.id, chunk_index = index, "chunk claim lost during append");
                Err(UploadError::Conflict {
                    chunk_index: index as u64,
                })
            }
            Some(SessionStatus::Finalized) => Err(UploadError::session_not_found(&session.id)),
            Some(SessionStatus::Expired) | None => {
                // reaped while we were appending, so our write rebuilt a discarded object
                warn!(session_id = %session.id, chunk_index = index, "session reaped during append, discarding object");
                if let Err(err) = self.store.discard(&session.storage_name).await {
                    warn!(session_id = %session.id, error = %err, "failed to discard partial object");
                }
                Err(UploadError::session_not_found(&session.id))
            }
        }
    }
}

async fn committed_indices(
    tx: &mut Transaction<'static, Sqlite>,
    session_id: &str,
) -> UploadResult<Vec<u64>> {
    let indices: Vec<i64> = sqlx::query_scalar(
        "SELECT chunk_index FROM upload_chunks
         WHERE session_id = ? AND committed = 1
         ORDER BY chunk_index ASC",
    )
    .bind(session_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(to_indices(indices))
}

fn to_indices(rows: Vec<i64>) -> Vec<u64> {
    rows.into_iter()
        .filter_map(|i| u64::try_from(i).ok())
        .collect()
}
