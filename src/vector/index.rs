//! In-memory embedding indexes.
//!
//! An [`EmbeddingIndex`] is a row-major matrix of quantized vectors with one
//! [`RowMetadata`] entry (and optionally one rank) per row. Indexes are
//! mutated only while private to their builder; once placed in the index
//! cache they are shared read-only behind an `Arc`.

use std::collections::{HashMap, HashSet};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::vector::VectorError;

/// Per-row bookkeeping overhead counted by [`EmbeddingIndex::estimate_size`].
///
/// Covers the `RowMetadata` struct itself, not the file name bytes.
pub const ROW_METADATA_OVERHEAD: usize = std::mem::size_of::<RowMetadata>();

/// Provenance of one embedding row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct RowMetadata {
    pub file_name: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl RowMetadata {
    pub fn new(file_name: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file_name: file_name.into(),
            start_line,
            end_line,
        }
    }
}

/// Source of document ranks, consulted when an index is filtered.
pub trait RankSource {
    /// Rank of the given file, a log2-scale reference count.
    fn rank(&self, file_name: &str) -> Option<f32>;
}

impl RankSource for HashMap<String, f32> {
    fn rank(&self, file_name: &str) -> Option<f32> {
        self.get(file_name).copied()
    }
}

/// Row-major matrix of quantized embeddings plus per-row metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingIndex {
    pub embeddings: Vec<i8>,
    pub column_dimension: usize,
    pub row_metadata: Vec<RowMetadata>,
    pub ranks: Vec<f32>,
}

impl EmbeddingIndex {
    /// Creates an empty index for vectors of the given dimension.
    #[must_use]
    pub fn new(column_dimension: usize) -> Self {
        Self {
            column_dimension,
            ..Self::default()
        }
    }

    /// Number of rows in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.row_metadata.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_metadata.is_empty()
    }

    /// Returns the `n`-th row.
    ///
    /// # Panics
    /// Panics if `n` is out of range.
    #[must_use]
    pub fn row(&self, n: usize) -> &[i8] {
        let start = n * self.column_dimension;
        &self.embeddings[start..start + self.column_dimension]
    }

    /// Appends one already-quantized row.
    pub fn push_row(
        &mut self,
        row: &[i8],
        metadata: RowMetadata,
        rank: Option<f32>,
    ) -> Result<(), VectorError> {
        if row.len() != self.column_dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.column_dimension,
                actual: row.len(),
            });
        }
        if let Some(rank) = rank {
            // Earlier rows without ranks count as rank 0
            self.ranks.resize(self.row_metadata.len(), 0.0);
            self.ranks.push(rank);
        } else if !self.ranks.is_empty() {
            self.ranks.push(0.0);
        }
        self.embeddings.extend_from_slice(row);
        self.row_metadata.push(metadata);
        Ok(())
    }

    /// Rough memory footprint in bytes, used for cache accounting only.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.embeddings.len()
            + self.row_metadata.len() * ROW_METADATA_OVERHEAD
            + self.ranks.len() * std::mem::size_of::<f32>()
    }

    /// Checks that embeddings, metadata and ranks line up.
    pub fn validate(&self) -> Result<(), VectorError> {
        let rows = self.row_metadata.len();
        if self.embeddings.len() != rows * self.column_dimension {
            return Err(VectorError::InvalidIndex {
                embeddings: self.embeddings.len(),
                rows,
                dimension: self.column_dimension,
            });
        }
        if !self.ranks.is_empty() && self.ranks.len() != rows {
            return Err(VectorError::RankMismatch {
                ranks: self.ranks.len(),
                rows,
            });
        }
        Ok(())
    }

    /// Removes every row whose file is in `removed`, compacting survivors to
    /// the front in their original order.
    ///
    /// Ranks of the surviving rows are rebuilt from `ranks`, never carried
    /// over. Files missing from the rank source get rank 0.
    pub fn filter(&mut self, removed: &HashSet<String>, ranks: &impl RankSource) {
        let dim = self.column_dimension;
        let mut kept = 0;

        for idx in 0..self.row_metadata.len() {
            if removed.contains(&self.row_metadata[idx].file_name) {
                continue;
            }
            if kept != idx {
                self.row_metadata.swap(kept, idx);
                self.embeddings
                    .copy_within(idx * dim..(idx + 1) * dim, kept * dim);
            }
            kept += 1;
        }

        self.row_metadata.truncate(kept);
        self.embeddings.truncate(kept * dim);
        self.ranks = self
            .row_metadata
            .iter()
            .map(|row| ranks.rank(&row.file_name).unwrap_or(0.0))
            .collect();
    }

    /// Appends all rows of `other` to this index.
    ///
    /// If only one side carries ranks, the other side's rows get rank 0 so the
    /// rank vector stays aligned with the rows.
    pub fn append(&mut self, other: &EmbeddingIndex) -> Result<(), VectorError> {
        if !other.is_empty() && !self.is_empty() && other.column_dimension != self.column_dimension
        {
            return Err(VectorError::DimensionMismatch {
                expected: self.column_dimension,
                actual: other.column_dimension,
            });
        }
        if self.is_empty() && !other.is_empty() {
            self.column_dimension = other.column_dimension;
        }

        if !self.ranks.is_empty() || !other.ranks.is_empty() {
            self.ranks.resize(self.row_metadata.len(), 0.0);
            if other.ranks.is_empty() {
                self.ranks
                    .extend(std::iter::repeat_n(0.0, other.row_metadata.len()));
            } else {
                self.ranks.extend_from_slice(&other.ranks);
            }
        }
        self.row_metadata.extend_from_slice(&other.row_metadata);
        self.embeddings.extend_from_slice(&other.embeddings);
        Ok(())
    }
}

/// Code and text indexes of one repository at one revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoEmbeddingIndex {
    pub repo_name: String,
    pub revision: String,
    /// Model identifier such as `"openai/text-embedding-ada-002"`. Empty for
    /// indexes written before models were recorded.
    pub embeddings_model: String,
    pub code_index: EmbeddingIndex,
    pub text_index: EmbeddingIndex,
}

impl RepoEmbeddingIndex {
    /// Whether queries embedded with `model` may be compared against this
    /// index. Untagged indexes are compatible with any model.
    #[must_use]
    pub fn is_model_compatible(&self, model: &str) -> bool {
        self.embeddings_model.is_empty() || self.embeddings_model == model
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.code_index.estimate_size() + self.text_index.estimate_size()
    }

    pub fn validate(&self) -> Result<(), VectorError> {
        self.code_index.validate()?;
        self.text_index.validate()
    }
}
