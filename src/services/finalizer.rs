//! Finalizer: converts a complete session into a catalog file record.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    UploadError, UploadResult,
    append_store::AppendStore,
    catalog::{FileCatalog, NewFile},
    ledger::ChunkLedger,
    registry::SessionRegistry,
};
use crate::{
    auth::Principal,
    models::{
        file::FileRecord,
        session::{SessionStatus, UploadSession},
    },
};

#[derive(Clone)]
pub struct Finalizer {
    db: Arc<SqlitePool>,
    registry: SessionRegistry,
    ledger: ChunkLedger,
    store: Arc<dyn AppendStore>,
    catalog: Arc<dyn FileCatalog>,
}

impl Finalizer {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: SessionRegistry,
        ledger: ChunkLedger,
        store: Arc<dyn AppendStore>,
        catalog: Arc<dyn FileCatalog>,
    ) -> Self {
        Self {
            db,
            registry,
            ledger,
            store,
            catalog,
        }
    }

    /// Finalize `session_id`.
    ///
    /// 1. Recompute progress; an incomplete ledger yields `Incomplete` with
    ///    the exact missing indices.
    /// 2. Claim the session (`active` -> `finalized`). Losing the claim to a
    ///    concurrent finalize or a reap is `NotFound`.
    /// 3. Seal the object and create the catalog record, reverting the claim
    ///    on failure so the caller can retry.
    /// 4. Delete the session and its ledger rows. A claim this step leaves
    ///    behind is cleared by the reaper after the session's TTL.
    ///
    /// Not repeatable: once the rows are gone a second call is `NotFound`.
    pub async fn finalize(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> UploadResult<FileRecord> {
        let session = self.registry.load_for(principal, session_id).await?;

        let progress = self.ledger.progress(&session).await?;
        if !progress.is_complete {
            let missing = progress.missing();
            info!(
                session_id,
                missing = missing.len(),
                uploaded = progress.uploaded_count,
                "finalize refused, upload incomplete"
            );
            return Err(UploadError::Incomplete { missing });
        }

        self.claim(&session).await?;

        let record = match self.publish(&session).await {
            Ok(record) => record,
            Err(err) => {
                warn!(session_id, error = %err, "finalize failed, releasing session");
                if let Err(release_err) = self.release(&session).await {
                    // the reaper clears the claim once the session's TTL has passed
                    warn!(session_id, error = %release_err, "failed to release finalize claim");
                }
                return Err(err);
            }
        };

        self.delete_session(&session.id).await?;

        info!(
            session_id,
            file_id = %record.id,
            size = record.size_bytes,
            "upload finalized"
        );
        Ok(record)
    }

    /// Catalog record created from `session_id`, for callers that got
    /// `NotFound` from finalize and need to know whether it already succeeded.
    pub async fn lookup_file(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> UploadResult<FileRecord> {
        self.catalog
            .find_by_session(&principal.id, session_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("file for upload session `{session_id}`")))
    }

    async fn publish(&self, session: &UploadSession) -> UploadResult<FileRecord> {
        let location = self
            .store
            .seal(&session.storage_name, session.total_size as u64)
            .await
            .map_err(|err| UploadError::Upstream(err.to_string()))?;

        self.catalog
            .create_file(NewFile {
                owner_id: session.owner_id.clone(),
                folder_id: session.folder_id.clone(),
                name: session.file_name.clone(),
                mime_type: session.mime_type.clone(),
                size_bytes: session.total_size as u64,
                storage_location: location,
                upload_session_id: session.id.clone(),
            })
            .await
    }

    async fn claim(&self, session: &UploadSession) -> UploadResult<()> {
        let claimed = sqlx::query("UPDATE upload_sessions SET status = ? WHERE id = ? AND status = ?")
            .bind(SessionStatus::Finalized)
            .bind(&session.id)
            .bind(SessionStatus::Active)
            .execute(&*self.db)
            .await?;

        if claimed.rows_affected() == 0 {
            return Err(UploadError::session_not_found(&session.id));
        }
        Ok(())
    }

    async fn release(&self, session: &UploadSession) -> UploadResult<()> {
        sqlx::query("UPDATE upload_sessions SET status = ? WHERE id = ? AND status = ?")
            .bind(SessionStatus::Active)
            .bind(&session.id)
            .bind(SessionStatus::Finalized)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> UploadResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        append_store::testing::MemoryAppendStore,
        catalog::SqliteCatalog,
        registry::SessionPolicy,
    };
    use crate::{db, models::api::InitUploadRequest};
    use bytes::Bytes;
    use std::{sync::atomic::Ordering, time::Duration};

    struct Fixture {
        registry: SessionRegistry,
        ledger: ChunkLedger,
        finalizer: Finalizer,
        store: Arc<MemoryAppendStore>,
        catalog: Arc<SqliteCatalog>,
        db: Arc<SqlitePool>,
    }

    async fn fixture() -> Fixture {
        let db = db::memory_pool().await;
        let store = Arc::new(MemoryAppendStore::default());
        let catalog = Arc::new(SqliteCatalog::new(db.clone()));
        let policy = SessionPolicy {
            min_chunk_size: 1,
            default_chunk_size: 2,
            ..SessionPolicy::default()
        };
        let registry = SessionRegistry::new(db.clone(), catalog.clone(), policy);
        let ledger = ChunkLedger::new(db.clone(), store.clone(), Duration::from_secs(1));
        let finalizer = Finalizer::new(
            db.clone(),
            registry.clone(),
            ledger.clone(),
            store.clone(),
            catalog.clone(),
        );
        Fixture {
            registry,
            ledger,
            finalizer,
            store,
            catalog,
            db,
        }
    }

    async fn session_of(f: &Fixture, chunks: u64) -> UploadSession {
        f.registry
            .init(
                &Principal::user("alice"),
                &InitUploadRequest {
                    file_name: "notes.txt".into(),
                    mime_type: "text/plain".into(),
                    total_size: chunks * 2,
                    destination_folder: None,
                    chunk_size: None,
                },
            )
            .await
            .unwrap()
    }

    async fn record(f: &Fixture, session: &UploadSession, indices: impl IntoIterator<Item = u64>) {
        for i in indices {
            f.ledger
                .record_chunk(session, i, Bytes::from(vec![i as u8; 2]))
                .await
                .unwrap();
        }
    }

    async fn file_count(db: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn incomplete_upload_reports_exact_missing_indices() {
        let f = fixture().await;
        let alice = Principal::user("alice");
        let session = session_of(&f, 10).await;
        record(&f, &session, [0, 1, 2, 4, 5, 7, 9]).await;

        let err = f.finalizer.finalize(&alice, &session.id).await.unwrap_err();
        match err {
            UploadError::Incomplete { missing } => assert_eq!(missing, vec![3, 6, 8]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(file_count(&f.db).await, 0);

        // the session is untouched and still accepts the missing chunks
        record(&f, &session, [3, 6, 8]).await;
        let file = f.finalizer.finalize(&alice, &session.id).await.unwrap();
        assert_eq!(file.size_bytes, 20);
    }

    #[tokio::test]
    async fn finalize_creates_one_record_then_not_found() {
        let f = fixture().await;
        let alice = Principal::user("alice");
        let session = session_of(&f, 3).await;
        record(&f, &session, [2, 0, 1]).await;

        let file = f.finalizer.finalize(&alice, &session.id).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.upload_session_id, session.id);
        assert_eq!(
            f.store.sealed_object(&session.storage_name).unwrap(),
            vec![0, 0, 1, 1, 2, 2]
        );

        let err = f.finalizer.finalize(&alice, &session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
        assert_eq!(file_count(&f.db).await, 1);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks")
            .fetch_one(&*f.db)
            .await
            .unwrap();
        assert_eq!(rows, 0);

        let found = f.finalizer.lookup_file(&alice, &session.id).await.unwrap();
        assert_eq!(found.id, file.id);
    }

    #[tokio::test]
    async fn other_principal_cannot_finalize() {
        let f = fixture().await;
        let session = session_of(&f, 1).await;
        record(&f, &session, [0]).await;

        let err = f
            .finalizer
            .finalize(&Principal::user("mallory"), &session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Forbidden));
        assert!(f.catalog.find_by_session("alice", &session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_seal_releases_the_session() {
        let f = fixture().await;
        let alice = Principal::user("alice");
        let session = session_of(&f, 2).await;
        record(&f, &session, [0, 1]).await;
        f.store.fail_seals.store(1, Ordering::SeqCst);

        let err = f.finalizer.finalize(&alice, &session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::Upstream(_)));
        assert_eq!(file_count(&f.db).await, 0);

        let file = f.finalizer.finalize(&alice, &session.id).await.unwrap();
        assert_eq!(file.size_bytes, 4);
    }
}
