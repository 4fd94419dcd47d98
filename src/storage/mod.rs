//! Index storage: blob stores, job lookup and the shared index cache.
//!
//! # Architecture
//! - `blob`: encoded index blobs on disk or in memory
//! - `jobs`: completion times of embedding jobs
//! - `index_cache`: byte-bounded LRU of decoded indexes
//! - `singleflight`: coalescing of concurrent fetches
//! - `cached_getter`: the cache front door used by search

pub mod blob;
pub mod cached_getter;
pub mod error;
pub mod index_cache;
pub mod jobs;
pub mod singleflight;

pub use blob::{
    Blob, BlobStore, FsBlobStore, MemoryBlobStore, download_index, repo_index_key, upload_index,
};
pub use cached_getter::CachedIndexGetter;
pub use error::{StorageError, StorageResult};
pub use index_cache::{CacheEntry, CacheStats, IndexCache};
pub use jobs::{JobStore, MemoryJobStore};
pub use singleflight::{Flight, SingleFlight};
