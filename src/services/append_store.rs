//! Storage append collaborator. The ledger hands every new chunk to an
//! [`AppendStore`], which assembles the destination object by byte offset, so
//! chunks may arrive in any order. [`DiskAppendStore`] keeps partial objects on
//! local disk sharded beneath `base_path/{shard}/{shard}/{name}`.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const PARTIAL_SUFFIX: &str = ".partial";
const MAX_DESTINATION_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid destination name `{0}`")]
    InvalidDestination(String),
    #[error("object `{name}` has {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("object `{0}` not found")]
    Missing(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One chunk handed to the append store.
#[derive(Clone, Debug)]
pub struct AppendRequest {
    pub destination: String,
    pub bytes: Bytes,
    pub owner_id: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    /// Byte offset of this chunk in the assembled object.
    pub offset: u64,
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
}

#[async_trait]
pub trait AppendStore: Send + Sync {
    /// Write `bytes` at `offset` of the partial object named `destination`.
    /// Writing the same bytes at the same offset twice leaves the object unchanged.
    async fn append(&self, req: AppendRequest) -> StorageResult<()>;

    /// Verify the assembled object is `expected_len` bytes long and publish it.
    /// Returns the location recorded in the file catalog.
    async fn seal(&self, destination: &str, expected_len: u64) -> StorageResult<String>;

    /// Drop a partial object. Missing objects are not an error.
    async fn discard(&self, destination: &str) -> StorageResult<()>;

    /// Readiness probe.
    async fn check_ready(&self) -> StorageResult<()>;
}

/// Local-disk append store.
#[derive(Clone, Debug)]
pub struct DiskAppendStore {
    /// Base directory on disk where objects are assembled.
    base_path: PathBuf,
}

impl DiskAppendStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Destination names are generated by the registry, but they still end
    /// up in a filesystem path, so reject anything that could escape it.
    fn ensure_name_safe(name: &str) -> StorageResult<()> {
        let unsafe_name = name.is_empty()
            || name.len() > MAX_DESTINATION_LEN
            || name.starts_with('.')
            || name.contains("..")
            || name
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
        if unsafe_name {
            return Err(StorageError::InvalidDestination(name.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers from MD5(name), to keep directories small.
    fn shards(name: &str) -> (String, String) {
        let digest = md5::compute(name);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(name);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        let mut path = self.object_path(name);
        path.set_file_name(format!("{name}{PARTIAL_SUFFIX}"));
        path
    }

    /// Remove empty shard directories up to (not including) `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl AppendStore for DiskAppendStore {
    async fn append(&self, req: AppendRequest) -> StorageResult<()> {
        Self::ensure_name_safe(&req.destination)?;
        let path = self.partial_path(&req.destination);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(req.offset)).await?;
        file.write_all(&req.bytes).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(
            destination = %req.destination,
            owner_id = %req.owner_id,
            chunk_index = req.chunk_index,
            total_chunks = req.total_chunks,
            offset = req.offset,
            len = req.bytes.len(),
            first = req.is_first_chunk,
            last = req.is_last_chunk,
            "appended chunk"
        );
        Ok(())
    }

    async fn seal(&self, destination: &str, expected_len: u64) -> StorageResult<String> {
        Self::ensure_name_safe(destination)?;
        let partial = self.partial_path(destination);
        let final_path = self.object_path(destination);

        let actual = match fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            // A previous seal may have published the object before the catalog write failed.
            Err(err) if err.kind() == ErrorKind::NotFound => match fs::metadata(&final_path).await
            {
                Ok(meta) if meta.len() == expected_len => {
                    return Ok(final_path.display().to_string());
                }
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::Missing(destination.to_string()));
                }
                Err(err) => return Err(err.into()),
            },
            Err(err) => return Err(err.into()),
        };

        if actual != expected_len {
            return Err(StorageError::SizeMismatch {
                name: destination.to_string(),
                expected: expected_len,
                actual,
            });
        }

        fs::rename(&partial, &final_path).await?;
        Ok(final_path.display().to_string())
    }

    async fn discard(&self, destination: &str) -> StorageResult<()> {
        Self::ensure_name_safe(destination)?;
        let partial = self.partial_path(destination);
        match fs::remove_file(&partial).await {
            Ok(_) => debug!("removed partial object {}", partial.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("partial object {} already missing", partial.display());
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = partial.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn check_ready(&self) -> StorageResult<()> {
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::other("file content mismatch")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, index: u64, offset: u64, bytes: &'static [u8]) -> AppendRequest {
        AppendRequest {
            destination: name.to_string(),
            bytes: Bytes::from_static(bytes),
            owner_id: "alice".into(),
            chunk_index: index,
            total_chunks: 3,
            offset,
            is_first_chunk: index == 0,
            is_last_chunk: index == 2,
        }
    }

    #[tokio::test]
    async fn assembles_out_of_order_chunks_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskAppendStore::new(dir.path());

        store.append(request("obj", 2, 8, b"ij")).await.unwrap();
        store.append(request("obj", 0, 0, b"abcd")).await.unwrap();
        store.append(request("obj", 1, 4, b"efgh")).await.unwrap();
        // retransmit of an already written chunk
        store.append(request("obj", 1, 4, b"efgh")).await.unwrap();

        let location = store.seal("obj", 10).await.unwrap();
        let contents = tokio::fs::read(&location).await.unwrap();
        assert_eq!(contents, b"abcdefghij");
    }

    #[tokio::test]
    async fn seal_rejects_short_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskAppendStore::new(dir.path());
        store.append(request("short", 0, 0, b"abcd")).await.unwrap();

        let err = store.seal("short", 10).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeMismatch {
                expected: 10,
                actual: 4,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn seal_is_repeatable_after_publish() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskAppendStore::new(dir.path());
        store.append(request("again", 0, 0, b"abcd")).await.unwrap();

        let first = store.seal("again", 4).await.unwrap();
        let second = store.seal("again", 4).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn discard_removes_partial_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskAppendStore::new(dir.path());
        store.append(request("gone", 0, 0, b"abcd")).await.unwrap();

        store.discard("gone").await.unwrap();
        store.discard("gone").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskAppendStore::new(dir.path());
        let err = store
            .append(request("../escape", 0, 0, b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDestination(_)));
    }
}
