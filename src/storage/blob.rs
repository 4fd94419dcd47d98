//! Backing stores for encoded embedding indexes.
//!
//! A blob store holds one encoded [`RepoEmbeddingIndex`] per key. The index
//! cache only ever reads from it; uploads come from the indexing pipeline.

use std::future::Future;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use memmap2::{Mmap, MmapOptions};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::storage::{StorageError, StorageResult};
use crate::vector::{RepoEmbeddingIndex, decode, encode};

/// File extension of stored repository indexes.
const INDEX_SUFFIX: &str = ".embeddingindex";

/// Bytes of one stored blob.
#[derive(Debug)]
pub enum Blob {
    Mapped(Mmap),
    Owned(Arc<Vec<u8>>),
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Owned(bytes) => bytes.as_slice(),
        }
    }
}

impl Blob {
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key/value store of encoded indexes.
pub trait BlobStore: Send + Sync + 'static {
    /// Fetches the blob stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = StorageResult<Blob>> + Send;

    /// Stores `data` under `key`, replacing any previous blob.
    fn upload(&self, key: &str, data: Vec<u8>) -> impl Future<Output = StorageResult<()>> + Send;
}

/// Blob key of a repository's index: the repo name with every character
/// outside `[A-Za-z0-9._-]` replaced by `_`.
#[must_use]
pub fn repo_index_key(repo_name: &str) -> String {
    let normalized: String = repo_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{normalized}{INDEX_SUFFIX}")
}

/// Encodes `index` with the current format and uploads it.
pub async fn upload_index<S: BlobStore + ?Sized>(
    store: &S,
    key: &str,
    index: &RepoEmbeddingIndex,
) -> StorageResult<()> {
    let mut buffer = Vec::new();
    encode(&mut buffer, index)?;
    store.upload(key, buffer).await
}

/// Fetches and decodes the index stored under `key`.
///
/// Decoding runs on the blocking pool since it is CPU bound.
pub async fn download_index<S: BlobStore + ?Sized>(
    store: &S,
    key: &str,
) -> StorageResult<RepoEmbeddingIndex> {
    let blob = store.get(key).await?;
    let size = blob.len();
    let index = tokio::task::spawn_blocking(move || decode(Cursor::new(blob))).await??;
    debug!(key, bytes = size, rows = index.code_index.len() + index.text_index.len(), "decoded index");
    Ok(index)
}

/// Blob store keeping one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn read_blob(path: &Path, key: &str) -> StorageResult<Blob> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Blob::Owned(Arc::new(Vec::new())));
        }
        // SAFETY: blobs are replaced by atomic rename, never written in place
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Blob::Mapped(mmap))
    }

    fn write_blob(root: &Path, path: &Path, data: &[u8]) -> StorageResult<()> {
        let parent = path.parent().unwrap_or(root);
        std::fs::create_dir_all(parent)?;

        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> StorageResult<Blob> {
        let path = self.path_for(key)?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::read_blob(&path, &key)).await?
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::write_blob(&root, &path, &data)).await?
    }
}

/// In-memory blob store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Arc<Vec<u8>>>,
    latency: Option<Duration>,
    gets: AtomicUsize,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every `get` by `latency`, simulating a remote store.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `get` calls served so far.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> StorageResult<Blob> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.blobs
            .get(key)
            .map(|bytes| Blob::Owned(Arc::clone(bytes.value())))
            .ok_or_else(|| StorageError::BlobNotFound {
                key: key.to_string(),
            })
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.blobs.insert(key.to_string(), Arc::new(data));
        Ok(())
    }
}
