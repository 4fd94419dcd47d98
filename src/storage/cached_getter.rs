//! Freshness-checked, coalesced access to repository indexes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::storage::{
    BlobStore, CacheEntry, IndexCache, JobStore, SingleFlight, StorageError, StorageResult,
    download_index, repo_index_key,
};
use crate::vector::{RepoEmbeddingIndex, RepoId};

type FetchOutcome = Result<Arc<RepoEmbeddingIndex>, Arc<StorageError>>;

/// Serves repository indexes from an [`IndexCache`], refetching when the
/// job store reports a newer completed job than the cached copy.
///
/// Concurrent misses for one repository share a single download. The
/// download runs detached from the callers: a caller whose token is
/// cancelled returns [`StorageError::Cancelled`] right away while the
/// download finishes and fills the cache for everyone else.
pub struct CachedIndexGetter<S, J> {
    blobs: Arc<S>,
    jobs: Arc<J>,
    cache: Arc<IndexCache>,
    flights: Arc<SingleFlight<RepoId, FetchOutcome>>,
}

impl<S, J> Clone for CachedIndexGetter<S, J> {
    fn clone(&self) -> Self {
        Self {
            blobs: Arc::clone(&self.blobs),
            jobs: Arc::clone(&self.jobs),
            cache: Arc::clone(&self.cache),
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<S: BlobStore, J: JobStore> CachedIndexGetter<S, J> {
    pub fn new(blobs: Arc<S>, jobs: Arc<J>, cache: Arc<IndexCache>) -> Self {
        Self {
            blobs,
            jobs,
            cache,
            flights: Arc::new(SingleFlight::new()),
        }
    }

    pub fn cache(&self) -> &Arc<IndexCache> {
        &self.cache
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        repo_id: RepoId,
        repo_name: &str,
    ) -> StorageResult<Arc<RepoEmbeddingIndex>> {
        let finished_at = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            result = self.jobs.last_completed_job(repo_id) => result?,
        };
        let Some(finished_at) = finished_at else {
            return Err(StorageError::NoCompletedJob { repo_id });
        };

        let key = repo_index_key(repo_name);
        if let Some(entry) = self.cache.get(&key) {
            if entry.finished_at >= finished_at {
                return Ok(entry.index);
            }
            debug!(repo = repo_name, cached = %entry.finished_at, latest = %finished_at, "cached index is stale");
        }

        let blobs = Arc::clone(&self.blobs);
        let cache = Arc::clone(&self.cache);
        let flight = self
            .flights
            .call(repo_id, move || fetch_and_cache(blobs, cache, key, finished_at));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            outcome = flight.wait() => match outcome {
                Some(Ok(index)) => Ok(index),
                Some(Err(e)) => Err(StorageError::Fetch(e)),
                None => Err(StorageError::Task(format!(
                    "index fetch for repository {repo_id} ended without a result"
                ))),
            },
        }
    }
}

async fn fetch_and_cache<S: BlobStore>(
    blobs: Arc<S>,
    cache: Arc<IndexCache>,
    key: String,
    finished_at: DateTime<Utc>,
) -> FetchOutcome {
    let index = download_index(blobs.as_ref(), &key)
        .await
        .map_err(Arc::new)?;
    let index = Arc::new(index);
    let cached = cache.add(key.as_str(), CacheEntry::new(Arc::clone(&index), finished_at));
    info!(key = %key, size = index.estimate_size(), cached, "fetched index");
    Ok(index)
}
