//! Byte-bounded LRU cache of decoded repository indexes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::vector::RepoEmbeddingIndex;

/// A cached index and the finish time of the job that produced it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub index: Arc<RepoEmbeddingIndex>,
    pub finished_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(index: Arc<RepoEmbeddingIndex>, finished_at: DateTime<Utc>) -> Self {
        Self { index, finished_at }
    }

    fn size(&self) -> usize {
        self.index.estimate_size()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub remaining_bytes: usize,
    pub capacity_bytes: usize,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    remaining_bytes: usize,
}

/// LRU cache whose budget is the summed `estimate_size` of its entries.
///
/// Entries larger than the whole budget are never stored.
pub struct IndexCache {
    inner: Mutex<Inner>,
    capacity_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl IndexCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                remaining_bytes: capacity_bytes,
            }),
            capacity_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts `entry` under `key`, evicting least recently used entries
    /// until it fits. Returns `false` if the entry exceeds the whole budget.
    ///
    /// An existing entry under the same key is replaced and its size refunded.
    pub fn add(&self, key: impl Into<String>, entry: CacheEntry) -> bool {
        let key = key.into();
        let size = entry.size();
        if size > self.capacity_bytes {
            debug!(key = %key, size, capacity = self.capacity_bytes, "index too large to cache");
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&key) {
            inner.remaining_bytes += previous.size();
        }
        while inner.remaining_bytes < size {
            let Some((evicted_key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.remaining_bytes += evicted.size();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %evicted_key, "evicted index");
        }
        inner.remaining_bytes -= size;
        inner.entries.put(key, entry);
        true
    }

    pub fn remaining_bytes(&self) -> usize {
        self.inner.lock().remaining_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            remaining_bytes: inner.remaining_bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("stats", &self.stats())
            .finish()
    }
}
