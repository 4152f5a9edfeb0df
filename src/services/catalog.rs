//! File catalog collaborator.
//!
//! Finalize turns a complete session into a durable [`FileRecord`] through a
//! [`FileCatalog`]. The registry also asks the catalog who owns a destination
//! folder. [`SqliteCatalog`] keeps both tables next to the session ledger.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use super::{UploadError, UploadResult, is_unique_violation};
use crate::models::file::{FileRecord, Folder};

/// Everything the catalog needs to create a file record.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub storage_location: String,
    pub upload_session_id: String,
}

#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Owner of `folder_id`, or `None` if the folder does not exist.
    async fn folder_owner(&self, folder_id: &str) -> UploadResult<Option<String>>;

    async fn create_folder(&self, owner_id: &str, name: &str) -> UploadResult<Folder>;

    /// Create the durable record for a finalized upload. A second record for
    /// the same session is rejected.
    async fn create_file(&self, file: NewFile) -> UploadResult<FileRecord>;

    /// Record created from `session_id`, if it belongs to `owner_id`.
    async fn find_by_session(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> UploadResult<Option<FileRecord>>;
}

#[derive(Clone)]
pub struct SqliteCatalog {
    db: Arc<SqlitePool>,
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FileCatalog for SqliteCatalog {
    async fn folder_owner(&self, folder_id: &str) -> UploadResult<Option<String>> {
        let owner = sqlx::query_scalar::<_, String>("SELECT owner_id FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(owner)
    }

    async fn create_folder(&self, owner_id: &str, name: &str) -> UploadResult<Folder> {
        let name = name.trim();
        if name.is_empty() || name.len() > 255 {
            return Err(UploadError::Validation(
                "folder name must be between 1 and 255 bytes".into(),
            ));
        }

        let folder = sqlx::query_as::<_, Folder>(
            "INSERT INTO folders (id, owner_id, name, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id, owner_id, name, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(folder)
    }

    async fn create_file(&self, file: NewFile) -> UploadResult<FileRecord> {
        let size_bytes = i64::try_from(file.size_bytes)
            .map_err(|_| UploadError::Validation("file size out of range".into()))?;

        let inserted = sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO files (
                id, owner_id, folder_id, name, mime_type, size_bytes,
                storage_location, upload_session_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, owner_id, folder_id, name, mime_type, size_bytes,
                      storage_location, upload_session_id, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&file.owner_id)
        .bind(&file.folder_id)
        .bind(&file.name)
        .bind(&file.mime_type)
        .bind(size_bytes)
        .bind(&file.storage_location)
        .bind(&file.upload_session_id)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match inserted {
            Ok(record) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(UploadError::session_not_found(
                &file.upload_session_id,
            )),
            Err(err) => Err(UploadError::Sqlx(err)),
        }
    }

    async fn find_by_session(
        &self,
        owner_id: &str,
        session_id: &str,
    ) -> UploadResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT id, owner_id, folder_id, name, mime_type, size_bytes,
                    storage_location, upload_session_id, created_at
             FROM files WHERE upload_session_id = ? AND owner_id = ?",
        )
        .bind(session_id)
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn new_file(session: &str) -> NewFile {
        NewFile {
            owner_id: "alice".into(),
            folder_id: None,
            name: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 42,
            storage_location: "/tmp/report".into(),
            upload_session_id: session.into(),
        }
    }

    #[tokio::test]
    async fn one_record_per_session() {
        let catalog = SqliteCatalog::new(db::memory_pool().await);

        let record = catalog.create_file(new_file("s1")).await.unwrap();
        assert_eq!(record.size_bytes, 42);

        let err = catalog.create_file(new_file("s1")).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));

        let found = catalog.find_by_session("alice", "s1").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(record.id));
        assert!(catalog.find_by_session("mallory", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn folder_owner_lookup() {
        let catalog = SqliteCatalog::new(db::memory_pool().await);
        let folder = catalog.create_folder("alice", "docs").await.unwrap();

        assert_eq!(
            catalog.folder_owner(&folder.id).await.unwrap().as_deref(),
            Some("alice")
        );
        assert!(catalog.folder_owner("missing").await.unwrap().is_none());
        assert!(catalog.create_folder("alice", "  ").await.is_err());
    }
}
