//! Session registry: creates upload sessions and gates every later call on
//! session liveness and ownership.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::info;
use uuid::Uuid;

use super::{UploadError, UploadResult, catalog::FileCatalog};
use crate::{
    auth::Principal,
    models::{
        api::InitUploadRequest,
        session::{SessionStatus, UploadSession, total_chunks_for},
    },
};

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_MIME_TYPE_LEN: usize = 255;

/// Limits applied when sessions are created.
#[derive(Clone, Debug)]
pub struct SessionPolicy {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_upload_size: u64,
    pub session_ttl: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            default_chunk_size: 5 * 1024 * 1024,
            min_chunk_size: 256 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            max_upload_size: 10 * 1024 * 1024 * 1024,
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SessionPolicy {
    /// Chunk size for a new session: the client's preference clamped to
    /// policy bounds, or the default.
    pub fn chunk_size_for(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_chunk_size)
            .clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    db: Arc<SqlitePool>,
    catalog: Arc<dyn FileCatalog>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(db: Arc<SqlitePool>, catalog: Arc<dyn FileCatalog>, policy: SessionPolicy) -> Self {
        Self {
            db,
            catalog,
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Validate the request and persist a new active session.
    pub async fn init(
        &self,
        principal: &Principal,
        req: &InitUploadRequest,
    ) -> UploadResult<UploadSession> {
        let file_name = validate_file_name(&req.file_name)?;
        validate_mime_type(&req.mime_type)?;

        if req.total_size > self.policy.max_upload_size {
            return Err(UploadError::PayloadTooLarge {
                size: req.total_size,
                max: self.policy.max_upload_size,
            });
        }

        if let Some(folder_id) = req.destination_folder.as_deref() {
            match self.catalog.folder_owner(folder_id).await? {
                Some(owner) if principal.may_access(&owner) => {}
                _ => {
                    return Err(UploadError::Validation(format!(
                        "invalid destination folder `{folder_id}`"
                    )));
                }
            }
        }

        let chunk_size = self.policy.chunk_size_for(req.chunk_size);
        let total_chunks = total_chunks_for(req.total_size, chunk_size);
        let created_at = Utc::now();
        let ttl = ChronoDuration::from_std(self.policy.session_ttl)
            .map_err(|_| UploadError::Validation("session ttl out of range".into()))?;

        let session = UploadSession {
            id: new_session_id(),
            owner_id: principal.id.clone(),
            storage_name: format!("{}-{}", Uuid::new_v4(), file_name),
            file_name,
            mime_type: req.mime_type.trim().to_string(),
            total_size: to_i64(req.total_size)?,
            chunk_size: to_i64(chunk_size)?,
            total_chunks: to_i64(total_chunks)?,
            folder_id: req.destination_folder.clone(),
            created_at,
            expires_at: created_at + ttl,
            status: SessionStatus::Active,
        };

        sqlx::query(
            "INSERT INTO upload_sessions (
                id, owner_id, file_name, mime_type, total_size, chunk_size, total_chunks,
                folder_id, storage_name, created_at, expires_at, status
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.file_name)
        .bind(&session.mime_type)
        .bind(session.total_size)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(&session.folder_id)
        .bind(&session.storage_name)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.status)
        .execute(&*self.db)
        .await?;

        info!(
            session_id = %session.id,
            owner = %session.owner_id,
            total_size = session.total_size,
            chunk_size = session.chunk_size,
            total_chunks = session.total_chunks,
            "upload session created"
        );

        Ok(session)
    }

    /// Fetch an active, unexpired session the principal may act on.
    ///
    /// Absent, finalized and expired sessions are all `NotFound`; a session
    /// owned by someone else is `Forbidden`.
    pub async fn load_for(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> UploadResult<UploadSession> {
        let session = self
            .fetch_active(session_id)
            .await?
            .filter(|s| !s.is_expired_at(Utc::now()))
            .ok_or_else(|| UploadError::session_not_found(session_id))?;

        if !principal.may_access(&session.owner_id) {
            tracing::warn!(
                session_id,
                principal = %principal.id,
                "principal does not own upload session"
            );
            return Err(UploadError::Forbidden);
        }

        Ok(session)
    }

    async fn fetch_active(&self, session_id: &str) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, file_name, mime_type, total_size, chunk_size, total_chunks,
                    folder_id, storage_name, created_at, expires_at, status
             FROM upload_sessions
             WHERE id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(SessionStatus::Active)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Sessions in `status` whose TTL elapsed before `now`, oldest first.
    pub async fn expired_ids(
        &self,
        status: SessionStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> UploadResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM upload_sessions
             WHERE status = ? AND expires_at <= ?
             ORDER BY expires_at ASC
             LIMIT ?",
        )
        .bind(status)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }
}

/// Reject empty, overlong and path-like names.
fn validate_file_name(name: &str) -> UploadResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(UploadError::Validation("file name must not be empty".into()));
    }
    if trimmed.len() > MAX_FILE_NAME_LEN {
        return Err(UploadError::Validation(format!(
            "file name exceeds {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if trimmed.contains("..")
        || trimmed
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(UploadError::Validation(
            "file name must not contain path separators, `..` or control characters".into(),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_mime_type(mime: &str) -> UploadResult<()> {
    let mime = mime.trim();
    let well_formed = mime.len() <= MAX_MIME_TYPE_LEN
        && matches!(mime.split_once('/'), Some((kind, sub)) if !kind.is_empty() && !sub.is_empty())
        && !mime.chars().any(|c| c.is_whitespace() || c.is_control());
    if !well_formed {
        return Err(UploadError::Validation(format!("invalid mime type `{mime}`")));
    }
    Ok(())
}

/// 128 random bits, hex encoded.
fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn to_i64(value: u64) -> UploadResult<i64> {
    i64::try_from(value).map_err(|_| UploadError::Validation(format!("{value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::catalog::SqliteCatalog};

    async fn registry_with(policy: SessionPolicy) -> (SessionRegistry, Arc<SqliteCatalog>) {
        let pool = db::memory_pool().await;
        let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
        (SessionRegistry::new(pool, catalog.clone(), policy), catalog)
    }

    fn request(name: &str, size: u64) -> InitUploadRequest {
        InitUploadRequest {
            file_name: name.into(),
            mime_type: "application/octet-stream".into(),
            total_size: size,
            destination_folder: None,
            chunk_size: None,
        }
    }

    #[tokio::test]
    async fn init_computes_chunks_and_expiry() {
        let (registry, _) = registry_with(SessionPolicy::default()).await;
        let alice = Principal::user("alice");

        let session = registry
            .init(&alice, &request("video.mp4", 12 * 1024 * 1024))
            .await
            .unwrap();

        assert_eq!(session.chunk_size, 5 * 1024 * 1024);
        assert_eq!(session.total_chunks, 3);
        assert_eq!(session.id.len(), 32);
        assert!(session.storage_name.ends_with("-video.mp4"));
        assert_eq!(
            (session.expires_at - session.created_at).num_hours(),
            24
        );

        let loaded = registry.load_for(&alice, &session.id).await.unwrap();
        assert_eq!(loaded.storage_name, session.storage_name);
    }

    #[tokio::test]
    async fn rejects_traversal_and_oversize() {
        let policy = SessionPolicy {
            max_upload_size: 1024,
            ..SessionPolicy::default()
        };
        let (registry, _) = registry_with(policy).await;
        let alice = Principal::user("alice");

        for name in ["../etc/passwd", "a/b", "a\\b", "  ", "bad\0name"] {
            let err = registry.init(&alice, &request(name, 1)).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{name:?}");
        }

        let err = registry
            .init(&alice, &request("big.bin", 1025))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PayloadTooLarge { max: 1024, .. }));

        let mut bad_mime = request("ok.bin", 1);
        bad_mime.mime_type = "nonsense".into();
        assert!(registry.init(&alice, &bad_mime).await.is_err());
    }

    #[tokio::test]
    async fn requested_chunk_size_is_clamped() {
        let (registry, _) = registry_with(SessionPolicy::default()).await;
        let mut req = request("tiny-chunks.bin", 1024 * 1024);
        req.chunk_size = Some(1);

        let session = registry
            .init(&Principal::user("alice"), &req)
            .await
            .unwrap();
        assert_eq!(session.chunk_size, 256 * 1024);
        assert_eq!(session.total_chunks, 4);
    }

    #[tokio::test]
    async fn destination_folder_must_belong_to_caller() {
        let (registry, catalog) = registry_with(SessionPolicy::default()).await;
        let folder = catalog.create_folder("alice", "docs").await.unwrap();

        let mut req = request("doc.txt", 10);
        req.destination_folder = Some(folder.id.clone());

        let err = registry
            .init(&Principal::user("bob"), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        registry.init(&Principal::user("alice"), &req).await.unwrap();
        registry.init(&Principal::admin("root"), &req).await.unwrap();

        req.destination_folder = Some("no-such-folder".into());
        assert!(registry.init(&Principal::user("alice"), &req).await.is_err());
    }

    #[tokio::test]
    async fn load_enforces_ownership_and_expiry() {
        let policy = SessionPolicy {
            session_ttl: Duration::ZERO,
            ..SessionPolicy::default()
        };
        let (expiring, _) = registry_with(policy).await;
        let alice = Principal::user("alice");
        let stale = expiring.init(&alice, &request("a.bin", 1)).await.unwrap();
        let err = expiring.load_for(&alice, &stale.id).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));

        let (registry, _) = registry_with(SessionPolicy::default()).await;
        let session = registry.init(&alice, &request("a.bin", 1)).await.unwrap();

        let err = registry
            .load_for(&Principal::user("bob"), &session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Forbidden));

        registry
            .load_for(&Principal::admin("ops"), &session.id)
            .await
            .unwrap();

        let err = registry.load_for(&alice, "unknown").await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }
}
