//! UploadService: the protocol operations the HTTP layer exposes, wired over
//! one SQLite pool and one set of collaborators.

use bytes::Bytes;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

use super::{
    UploadResult,
    append_store::AppendStore,
    catalog::FileCatalog,
    finalizer::Finalizer,
    ledger::ChunkLedger,
    reaper::Reaper,
    registry::{SessionPolicy, SessionRegistry},
};
use crate::{
    auth::Principal,
    models::{
        api::{ChunkAck, FinalizedFile, InitUploadRequest, InitUploadResponse, UploadStatus},
        file::Folder,
    },
};

/// Shared handler state. Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool holding sessions, ledger and catalog.
    pub db: Arc<SqlitePool>,
    pub store: Arc<dyn AppendStore>,
    catalog: Arc<dyn FileCatalog>,
    registry: SessionRegistry,
    ledger: ChunkLedger,
    finalizer: Finalizer,
}

impl UploadService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<dyn AppendStore>,
        catalog: Arc<dyn FileCatalog>,
        policy: SessionPolicy,
        append_timeout: Duration,
    ) -> Self {
        let registry = SessionRegistry::new(db.clone(), catalog.clone(), policy);
        let ledger = ChunkLedger::new(db.clone(), store.clone(), append_timeout);
        let finalizer = Finalizer::new(
            db.clone(),
            registry.clone(),
            ledger.clone(),
            store.clone(),
            catalog.clone(),
        );
        Self {
            db,
            store,
            catalog,
            registry,
            ledger,
            finalizer,
        }
    }

    /// A reaper sharing this service's pool and append store.
    pub fn reaper(&self, batch_size: u32) -> Reaper {
        Reaper::new(
            self.db.clone(),
            self.registry.clone(),
            self.store.clone(),
            batch_size,
        )
    }

    pub async fn init(
        &self,
        principal: &Principal,
        req: &InitUploadRequest,
    ) -> UploadResult<InitUploadResponse> {
        let session = self.registry.init(principal, req).await?;
        Ok(InitUploadResponse {
            session_id: session.id,
            total_chunks: session.total_chunks as u64,
            chunk_size: session.chunk_size as u64,
            expires_at: session.expires_at,
        })
    }

    pub async fn record_chunk(
        &self,
        principal: &Principal,
        session_id: &str,
        chunk_index: u64,
        bytes: Bytes,
    ) -> UploadResult<ChunkAck> {
        let session = self.registry.load_for(principal, session_id).await?;
        let progress = self.ledger.record_chunk(&session, chunk_index, bytes).await?;
        Ok(ChunkAck::new(chunk_index, &progress))
    }

    pub async fn status(&self, principal: &Principal, session_id: &str) -> UploadResult<UploadStatus> {
        let session = self.registry.load_for(principal, session_id).await?;
        let progress = self.ledger.progress(&session).await?;
        Ok(UploadStatus {
            session_id: session.id,
            uploaded_count: progress.uploaded_count,
            uploaded_indices: progress.uploaded_indices,
            total_chunks: progress.total_chunks,
            chunk_size: session.chunk_size as u64,
            progress_percent: progress.progress_percent,
            is_complete: progress.is_complete,
            expires_at: session.expires_at,
        })
    }

    pub async fn finalize(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> UploadResult<FinalizedFile> {
        let record = self.finalizer.finalize(principal, session_id).await?;
        Ok(record.into())
    }

    pub async fn lookup_file(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> UploadResult<FinalizedFile> {
        let record = self.finalizer.lookup_file(principal, session_id).await?;
        Ok(record.into())
    }

    pub async fn create_folder(&self, principal: &Principal, name: &str) -> UploadResult<Folder> {
        self.catalog.create_folder(&principal.id, name).await
    }

    /// Max chunk body the HTTP layer should accept.
    pub fn max_chunk_size(&self) -> u64 {
        self.registry.policy().max_chunk_size
    }
}
