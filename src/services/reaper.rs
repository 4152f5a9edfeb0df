//! Background sweep that expires abandoned upload sessions.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{UploadResult, append_store::AppendStore, registry::SessionRegistry};
use crate::models::session::SessionStatus;

#[derive(Clone)]
pub struct Reaper {
    db: Arc<SqlitePool>,
    registry: SessionRegistry,
    store: Arc<dyn AppendStore>,
    batch_size: u32,
}

impl Reaper {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: SessionRegistry,
        store: Arc<dyn AppendStore>,
        batch_size: u32,
    ) -> Self {
        Self {
            db,
            registry,
            store,
            batch_size,
        }
    }

    /// Expire every active session whose TTL elapsed before `now`, then clear
    /// finalize claims that outlived the TTL.
    ///
    /// Each session is claimed with a conditional update on `status = 'active'`,
    /// so a session a finalize already claimed is skipped until its TTL has
    /// passed. Returns the number of sessions removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> UploadResult<usize> {
        let expired = self.expire_active(now).await?;
        let cleared = self.clear_stale_claims(now).await?;

        if expired + cleared > 0 {
            info!(expired, cleared, "expired upload sessions reaped");
        }
        Ok(expired + cleared)
    }

    async fn expire_active(&self, now: DateTime<Utc>) -> UploadResult<usize> {
        let candidates = self
            .registry
            .expired_ids(SessionStatus::Active, now, self.batch_size)
            .await?;
        let mut reaped = 0;

        for session_id in candidates {
            let mut tx = self.db.begin().await?;

            let storage_name: Option<String> = sqlx::query_scalar(
                "UPDATE upload_sessions SET status = ?
                 WHERE id = ? AND status = ? AND expires_at <= ?
                 RETURNING storage_name",
            )
            .bind(SessionStatus::Expired)
            .bind(&session_id)
            .bind(SessionStatus::Active)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(storage_name) = storage_name else {
                debug!(session_id, "session left active state before reap, skipping");
                tx.rollback().await?;
                continue;
            };

            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(&session_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
                .bind(&session_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            if let Err(err) = self.store.discard(&storage_name).await {
                warn!(session_id, error = %err, "failed to discard partial object");
            }
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Remove sessions a finalize claimed but never deleted: a failed release,
    /// a failed cleanup after the catalog insert, or a crash in between.
    ///
    /// The object is kept, since a catalog record may already point at it.
    async fn clear_stale_claims(&self, now: DateTime<Utc>) -> UploadResult<usize> {
        let candidates = self
            .registry
            .expired_ids(SessionStatus::Finalized, now, self.batch_size)
            .await?;
        let mut cleared = 0;

        for session_id in candidates {
            let mut tx = self.db.begin().await?;

            let deleted = sqlx::query(
                "DELETE FROM upload_sessions WHERE id = ? AND status = ? AND expires_at <= ?",
            )
            .bind(&session_id)
            .bind(SessionStatus::Finalized)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if deleted.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
                .bind(&session_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            warn!(session_id, "cleared finalize claim left past its TTL");
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        warn!(error = %err, "reaper sweep failed");
                    }
                }
            }
        }
    }
}
