use std::sync::Arc;

use thiserror::Error;

use crate::vector::{CodecError, RepoId};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {key}")]
    BlobNotFound { key: String },

    #[error("Invalid blob key '{key}': keys must be relative and must not contain '..'")]
    InvalidKey { key: String },

    #[error("Index codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Job store error: {0}")]
    JobStore(String),

    #[error("No completed embedding job for repository {repo_id}")]
    NoCompletedJob { repo_id: RepoId },

    #[error("Shared index fetch failed: {0}")]
    Fetch(Arc<StorageError>),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
