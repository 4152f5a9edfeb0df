//! Chunk planning and on-demand chunk reads.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeSet,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use crate::models::session::total_chunks_for;

/// One ordinal byte range of the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub len: u64,
}

/// Split of `total_size` bytes into `chunk_size` chunks; the last one holds the remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            total_size,
            chunk_size,
            total_chunks: total_chunks_for(total_size, chunk_size),
        }
    }

    pub fn span(&self, index: u64) -> Option<ChunkSpan> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index * self.chunk_size;
        let len = self.total_size.saturating_sub(offset).min(self.chunk_size);
        Some(ChunkSpan { index, offset, len })
    }

    pub fn spans(&self) -> impl Iterator<Item = ChunkSpan> + '_ {
        (0..self.total_chunks).filter_map(|i| self.span(i))
    }

    /// Indices not yet in `recorded`, ascending: what a resumed transfer must send.
    pub fn pending(&self, recorded: &[u64]) -> Vec<u64> {
        let recorded: BTreeSet<u64> = recorded.iter().copied().collect();
        (0..self.total_chunks)
            .filter(|i| !recorded.contains(i))
            .collect()
    }
}

/// Random-access source of chunk bytes. Chunks are read when dispatched, so
/// at most `parallelism` chunks are held in memory at once.
#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    fn total_size(&self) -> u64;

    async fn read(&self, span: ChunkSpan) -> io::Result<Bytes>;
}

/// A file on local disk. Each read opens its own handle, so concurrent reads
/// do not share a cursor.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            path,
            len: meta.len(),
        })
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn total_size(&self) -> u64 {
        self.len
    }

    async fn read(&self, span: ChunkSpan) -> io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(span.offset)).await?;
        let mut buf = vec![0u8; span.len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ChunkSource for Bytes {
    fn total_size(&self) -> u64 {
        self.len() as u64
    }

    async fn read(&self, span: ChunkSpan) -> io::Result<Bytes> {
        let start = span.offset as usize;
        let end = start + span.len as usize;
        if end > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunk span beyond end of source",
            ));
        }
        Ok(self.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn twelve_mib_in_five_mib_chunks() {
        let plan = ChunkPlan::new(12 * MIB, 5 * MIB);
        assert_eq!(plan.total_chunks, 3);
        let lens: Vec<u64> = plan.spans().map(|s| s.len).collect();
        assert_eq!(lens, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_eq!(plan.span(2).unwrap().offset, 10 * MIB);
        assert!(plan.span(3).is_none());
    }

    #[test]
    fn pending_is_complement_of_recorded() {
        let plan = ChunkPlan::new(100, 10);
        assert_eq!(plan.pending(&[0, 1, 2, 4, 5, 6, 8]), vec![3, 7, 9]);
        assert!(plan.pending(&(0..10).collect::<Vec<_>>()).is_empty());
    }

    #[tokio::test]
    async fn file_source_reads_spans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, b"0123456789ab").await.unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.total_size(), 12);
        assert_eq!(source.file_name().as_deref(), Some("source.bin"));

        let plan = ChunkPlan::new(12, 5);
        let last = source.read(plan.span(2).unwrap()).await.unwrap();
        assert_eq!(&last[..], b"ab");
        let middle = source.read(plan.span(1).unwrap()).await.unwrap();
        assert_eq!(&middle[..], b"56789");
    }

    proptest! {
        #[test]
        fn spans_cover_source_exactly(total in 0u64..10_000_000, chunk in 1u64..2_000_000) {
            let plan = ChunkPlan::new(total, chunk);
            prop_assert_eq!(plan.total_chunks, total.div_ceil(chunk).max(1));

            let spans: Vec<ChunkSpan> = plan.spans().collect();
            prop_assert_eq!(spans.len() as u64, plan.total_chunks);
            prop_assert_eq!(spans.iter().map(|s| s.len).sum::<u64>(), total);
            for pair in spans.windows(2) {
                prop_assert_eq!(pair[0].len, chunk);
                prop_assert_eq!(pair[0].offset + pair[0].len, pair[1].offset);
            }
        }
    }
}
