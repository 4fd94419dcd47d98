//! Lookup of embedding job completion times.

use std::future::Future;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::storage::StorageResult;
use crate::vector::RepoId;

/// Source of truth for when a repository's index was last rebuilt.
pub trait JobStore: Send + Sync + 'static {
    /// Finish time of the latest completed embedding job for `repo_id`, or
    /// `None` if the repository has never been indexed.
    fn last_completed_job(
        &self,
        repo_id: RepoId,
    ) -> impl Future<Output = StorageResult<Option<DateTime<Utc>>>> + Send;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    completed: DashMap<RepoId, DateTime<Utc>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed job. Older completions never replace newer ones.
    pub fn complete_job(&self, repo_id: RepoId, finished_at: DateTime<Utc>) {
        self.completed
            .entry(repo_id)
            .and_modify(|current| {
                if finished_at > *current {
                    *current = finished_at;
                }
            })
            .or_insert(finished_at);
    }
}

impl JobStore for MemoryJobStore {
    async fn last_completed_job(&self, repo_id: RepoId) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.completed.get(&repo_id).map(|entry| *entry.value()))
    }
}
