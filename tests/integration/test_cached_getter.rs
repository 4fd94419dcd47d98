//! Test: coalescing, freshness and cancellation of the cached index getter
//!
//! Uses a latency-injecting in-memory blob store so concurrent callers
//! genuinely overlap with the in-flight fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use embsearch::storage::{
    CachedIndexGetter, IndexCache, MemoryBlobStore, MemoryJobStore, StorageError, repo_index_key,
    upload_index,
};
use embsearch::vector::{EmbeddingIndex, RepoEmbeddingIndex, RepoId, RowMetadata};
use tokio_util::sync::CancellationToken;

const CONCURRENT_CALLERS: usize = 32;
const FETCH_LATENCY: Duration = Duration::from_millis(150);

type Getter = CachedIndexGetter<MemoryBlobStore, MemoryJobStore>;

fn repo_index(name: &str, revision: &str, rows: usize) -> RepoEmbeddingIndex {
    let mut code_index = EmbeddingIndex::new(4);
    for row in 0..rows {
        code_index
            .push_row(&[1, 2, 3, 4], RowMetadata::new(format!("src/{row}.rs"), 1, 2), None)
            .expect("valid row");
    }
    RepoEmbeddingIndex {
        repo_name: name.to_string(),
        revision: revision.to_string(),
        embeddings_model: "test-model".to_string(),
        code_index,
        text_index: EmbeddingIndex::new(4),
    }
}

async fn setup(capacity_bytes: usize) -> (Getter, Arc<MemoryBlobStore>, Arc<MemoryJobStore>) {
    let blobs = Arc::new(MemoryBlobStore::new().with_latency(FETCH_LATENCY));
    let jobs = Arc::new(MemoryJobStore::new());
    let getter = CachedIndexGetter::new(
        Arc::clone(&blobs),
        Arc::clone(&jobs),
        Arc::new(IndexCache::new(capacity_bytes)),
    );
    (getter, blobs, jobs)
}

async fn publish(blobs: &MemoryBlobStore, index: &RepoEmbeddingIndex) {
    upload_index(blobs, &repo_index_key(&index.repo_name), index)
        .await
        .expect("upload should succeed");
}

async fn get_concurrently(
    getter: &Getter,
    repo_id: RepoId,
    repo_name: &str,
) -> Vec<Result<Arc<RepoEmbeddingIndex>, StorageError>> {
    let handles: Vec<_> = (0..CONCURRENT_CALLERS)
        .map(|_| {
            let getter = getter.clone();
            let repo_name = repo_name.to_string();
            tokio::spawn(async move {
                getter
                    .get(&CancellationToken::new(), repo_id, &repo_name)
                    .await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.expect("caller task should not panic"));
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_fetch_once() {
    let (getter, blobs, jobs) = setup(1 << 20).await;
    let repo_id = RepoId::new(1);
    publish(&blobs, &repo_index("acme/app", "v1", 3)).await;
    jobs.complete_job(repo_id, Utc::now());

    let results = get_concurrently(&getter, repo_id, "acme/app").await;

    let first = results[0].as_ref().expect("fetch should succeed");
    for result in &results {
        let index = result.as_ref().expect("fetch should succeed");
        assert!(Arc::ptr_eq(index, first), "all callers share one decoded index");
    }
    assert_eq!(blobs.get_count(), 1);
    assert_eq!(getter.cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_entry_refetched_once() {
    let (getter, blobs, jobs) = setup(1 << 20).await;
    let repo_id = RepoId::new(1);
    let first_job = Utc::now();
    publish(&blobs, &repo_index("acme/app", "v1", 3)).await;
    jobs.complete_job(repo_id, first_job);

    let warm = getter
        .get(&CancellationToken::new(), repo_id, "acme/app")
        .await
        .expect("initial fetch");
    assert_eq!(warm.revision, "v1");

    // A newer job completes and replaces the blob
    publish(&blobs, &repo_index("acme/app", "v2", 5)).await;
    jobs.complete_job(repo_id, first_job + chrono::Duration::seconds(30));

    let results = get_concurrently(&getter, repo_id, "acme/app").await;
    for result in results {
        assert_eq!(result.expect("refetch should succeed").revision, "v2");
    }
    assert_eq!(blobs.get_count(), 2);

    // Fresh now, no further fetches
    getter
        .get(&CancellationToken::new(), repo_id, "acme/app")
        .await
        .expect("cached");
    assert_eq!(blobs.get_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_caller_does_not_abort_fetch() {
    let (getter, blobs, jobs) = setup(1 << 20).await;
    let repo_id = RepoId::new(1);
    publish(&blobs, &repo_index("acme/app", "v1", 3)).await;
    jobs.complete_job(repo_id, Utc::now());

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = getter.get(&token, repo_id, "acme/app").await;
    assert!(matches!(result, Err(StorageError::Cancelled)));
    assert!(
        started.elapsed() < FETCH_LATENCY,
        "cancellation must not wait for the fetch"
    );

    // The detached fetch still completes and warms the cache
    tokio::time::sleep(FETCH_LATENCY * 2).await;
    assert_eq!(getter.cache().len(), 1);

    let index = getter
        .get(&CancellationToken::new(), repo_id, "acme/app")
        .await
        .expect("served from cache");
    assert_eq!(index.revision, "v1");
    assert_eq!(blobs.get_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_failure_shared_and_not_cached() {
    let (getter, blobs, jobs) = setup(1 << 20).await;
    let repo_id = RepoId::new(9);
    jobs.complete_job(repo_id, Utc::now());

    let results = get_concurrently(&getter, repo_id, "acme/missing").await;
    for result in results {
        match result {
            Err(StorageError::Fetch(inner)) => {
                assert!(matches!(*inner, StorageError::BlobNotFound { .. }));
            }
            other => panic!("expected shared fetch failure, got {other:?}"),
        }
    }
    assert_eq!(blobs.get_count(), 1);

    // Once the blob appears the next call retries instead of replaying the error
    publish(&blobs, &repo_index("acme/missing", "v1", 1)).await;
    let index = getter
        .get(&CancellationToken::new(), repo_id, "acme/missing")
        .await
        .expect("retry should succeed");
    assert_eq!(index.revision, "v1");
    assert_eq!(blobs.get_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_index_is_always_refetched() {
    let small = repo_index("acme/app", "v1", 1);
    let (getter, blobs, jobs) = setup(small.estimate_size()).await;
    let repo_id = RepoId::new(3);
    publish(&blobs, &repo_index("acme/big", "v1", 64)).await;
    jobs.complete_job(repo_id, Utc::now());

    for attempt in 1..=3 {
        let index = getter
            .get(&CancellationToken::new(), repo_id, "acme/big")
            .await
            .expect("oversized indexes are still served");
        assert_eq!(index.code_index.len(), 64);
        assert_eq!(blobs.get_count(), attempt);
    }
    assert!(getter.cache().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_evicts_least_recently_used_repo() {
    let template = repo_index("x", "v1", 8);
    let (getter, blobs, jobs) = setup(template.estimate_size() * 2).await;
    let now = Utc::now();

    for (id, name) in [(1, "acme/a"), (2, "acme/b"), (3, "acme/c")] {
        publish(&blobs, &repo_index(name, "v1", 8)).await;
        jobs.complete_job(RepoId::new(id), now);
    }
    let token = CancellationToken::new();

    getter.get(&token, RepoId::new(1), "acme/a").await.expect("a");
    getter.get(&token, RepoId::new(2), "acme/b").await.expect("b");
    // Touch a so b is the least recently used
    getter.get(&token, RepoId::new(1), "acme/a").await.expect("a again");
    getter.get(&token, RepoId::new(3), "acme/c").await.expect("c");
    assert_eq!(blobs.get_count(), 3);

    let stats = getter.cache().stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 1);

    // a stays cached, b was evicted and has to be fetched again
    getter.get(&token, RepoId::new(1), "acme/a").await.expect("a cached");
    assert_eq!(blobs.get_count(), 3);
    getter.get(&token, RepoId::new(2), "acme/b").await.expect("b refetched");
    assert_eq!(blobs.get_count(), 4);
}
