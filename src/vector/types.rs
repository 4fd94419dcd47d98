//! Type-safe wrappers and core types for embedding search.
//!
//! Newtypes here keep repository identifiers and scores from being mixed up
//! with the plain integers that flow through the search kernels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type-safe wrapper for repository IDs assigned by the repository store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId(u32);

impl RepoId {
    /// Creates a new `RepoId`.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Score breakdown for a single candidate row.
///
/// `score` is always `similarity + rank`. Ordering compares `score` only;
/// the search layer adds its own tie-break on row index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoreDetails {
    pub score: i32,
    pub similarity: i32,
    pub rank: i32,
}

impl ScoreDetails {
    #[must_use]
    pub fn new(similarity: i32, rank: i32) -> Self {
        Self {
            score: similarity.wrapping_add(rank),
            similarity,
            rank,
        }
    }
}

/// Errors that can occur while building or validating embedding indexes.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "Invalid embedding index: {embeddings} embeddings for {rows} rows of dimension {dimension}\nSuggestion: The index is corrupted or was built by a broken pipeline, reindex the repository"
    )]
    InvalidIndex {
        embeddings: usize,
        rows: usize,
        dimension: usize,
    },

    #[error(
        "Rank count mismatch: {ranks} ranks for {rows} rows\nSuggestion: Recompute document ranks for the repository"
    )]
    RankMismatch { ranks: usize, rows: usize },
}
