//! Error types for the embedding search service
//!
//! Each layer owns its error enum (`VectorError`, `CodecError`,
//! `StorageError`). `SearchError` is what callers of the search API see.

use thiserror::Error;

use crate::storage::StorageError;
use crate::vector::{RepoId, VectorError};

pub use crate::storage::StorageResult;
pub use crate::vector::CodecResult;

/// Errors surfaced by a search request
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(
        "No embeddings index found for repository '{repo_name}'\nSuggestion: Run an embeddings job for the repository first"
    )]
    IndexNotFound { repo_name: String },

    #[error(
        "The embeddings index for repository '{repo_name}' was built with model '{index_model}' but the query uses '{query_model}'\nSuggestion: Reindex the repository to use embeddings search"
    )]
    ModelMismatch {
        repo_name: String,
        index_model: String,
        query_model: String,
    },

    #[error("Failed to embed query: {reason}")]
    Embedding { reason: String },

    #[error("Invalid search request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] VectorError),

    #[error("Index storage error: {0}")]
    Storage(StorageError),

    #[error("Search was cancelled")]
    Cancelled,

    #[error("Search task failed: {0}")]
    Task(String),
}

impl From<StorageError> for SearchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => Self::Cancelled,
            other => Self::Storage(other),
        }
    }
}

impl From<tokio::task::JoinError> for SearchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl SearchError {
    /// Maps a getter error for `repo_name`, turning "no completed job" into
    /// [`SearchError::IndexNotFound`].
    pub fn from_storage(err: StorageError, repo_id: RepoId, repo_name: &str) -> Self {
        match err {
            StorageError::NoCompletedJob { repo_id: missing } if missing == repo_id => {
                Self::IndexNotFound {
                    repo_name: repo_name.to_string(),
                }
            }
            other => other.into(),
        }
    }

    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::IndexNotFound { .. } => "INDEX_NOT_FOUND",
            Self::ModelMismatch { .. } => "MODEL_MISMATCH",
            Self::Embedding { .. } => "EMBEDDING_FAILED",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Task(_) => "TASK_FAILED",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::IndexNotFound { .. } => vec![
                "Check the repository name, it must match the indexed name exactly",
                "Wait for the first embeddings job of the repository to complete",
            ],
            Self::ModelMismatch { .. } => vec![
                "Reindex the repository with the current embeddings model",
                "Or configure search.embeddings_model to match the index",
            ],
            Self::InvalidQuery(_) => vec![
                "The query vector must have the same dimension as the index",
            ],
            Self::Storage(_) => vec![
                "Check that the blob store is reachable and the index blob exists",
                "Retry the request, failed fetches are never cached",
            ],
            _ => vec![],
        }
    }
}

/// Result type alias for search operations
pub type SearchResult<T> = Result<T, SearchError>;
