//! Top-K similarity search over a single embedding index.
//!
//! Rows are split into contiguous ranges, each range keeps its best
//! `num_results` candidates in a bounded min-heap, and the partial heaps are
//! merged by descending score once every range has finished.
//!
//! Candidates are ordered by score, then by ascending row index. The second
//! key makes the result independent of how rows were partitioned.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vector::{DotKernel, EmbeddingIndex, ScoreDetails};

/// Weight of the vector similarity in the blended score.
pub const SIMILARITY_WEIGHT: i32 = 2;

/// Weight of the document rank in the blended score.
pub const RANK_WEIGHT: i32 = 1;

/// Ranks are log2 reference counts, capped here.
const MAX_RANK: f32 = 32.0;

/// Largest dot product of two quantized unit vectors. Normalized ranks are
/// expressed in this unit so they are comparable to similarities.
const RANK_SCALE: f32 = 127.0 * 127.0;

/// How a search is spread over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub num_workers: usize,
    /// Indexes with at most this many rows are scanned on the calling thread.
    pub min_rows_to_split: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            min_rows_to_split: 1_000,
        }
    }
}

/// Scoring knobs for a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub use_document_ranks: bool,
}

/// Half-open range of rows assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialRows {
    pub start: usize,
    pub end: usize,
}

impl PartialRows {
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A candidate row held in a partial heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearestNeighbor {
    pub row: usize,
    pub score_details: ScoreDetails,
}

impl Ord for NearestNeighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score_details
            .score
            .cmp(&other.score_details.score)
            .then_with(|| other.row.cmp(&self.row))
    }
}

impl PartialOrd for NearestNeighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One search hit, labelled with the repository it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSearchResult {
    pub repo_name: String,
    pub revision: String,
    pub file_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: i32,
    pub similarity_score: i32,
    pub rank_score: i32,
}

/// Splits `[0, num_rows)` into at most `num_workers` contiguous ranges.
///
/// Small inputs get a single range. Otherwise every range holds
/// `ceil(num_rows / num_workers)` rows, except the tail ranges which may be
/// shorter or empty.
#[must_use]
pub fn split_rows(num_rows: usize, num_workers: usize, min_rows_to_split: usize) -> Vec<PartialRows> {
    let num_workers = num_workers.max(1);
    if num_workers == 1 || num_rows <= num_workers || num_rows <= min_rows_to_split {
        return vec![PartialRows::new(0, num_rows)];
    }

    let per_worker = num_rows.div_ceil(num_workers);
    (0..num_workers)
        .map(|worker| {
            let start = (worker * per_worker).min(num_rows);
            let end = (start + per_worker).min(num_rows);
            PartialRows::new(start, end)
        })
        .collect()
}

/// Blended score of row `row` against `query`.
#[must_use]
pub fn score_row(
    index: &EmbeddingIndex,
    kernel: &dyn DotKernel,
    query: &[i8],
    row: usize,
    opts: SearchOptions,
) -> ScoreDetails {
    let similarity = SIMILARITY_WEIGHT.wrapping_mul(kernel.dot(index.row(row), query));
    let rank = match index.ranks.get(row) {
        Some(&rank) if opts.use_document_ranks => {
            let normalized = (rank / MAX_RANK).clamp(0.0, 1.0);
            RANK_WEIGHT * (normalized * RANK_SCALE) as i32
        }
        _ => 0,
    };
    ScoreDetails::new(similarity, rank)
}

/// Keeps the best `num_results` rows of one range.
fn partial_search(
    index: &EmbeddingIndex,
    kernel: &dyn DotKernel,
    query: &[i8],
    num_results: usize,
    rows: PartialRows,
    opts: SearchOptions,
) -> Vec<NearestNeighbor> {
    let seed_end = rows.start + num_results.min(rows.len());
    let mut heap: BinaryHeap<Reverse<NearestNeighbor>> = (rows.start..seed_end)
        .map(|row| {
            Reverse(NearestNeighbor {
                row,
                score_details: score_row(index, kernel, query, row, opts),
            })
        })
        .collect();

    for row in seed_end..rows.end {
        let candidate = NearestNeighbor {
            row,
            score_details: score_row(index, kernel, query, row, opts),
        };
        if let Some(mut worst) = heap.peek_mut() {
            if candidate > worst.0 {
                *worst = Reverse(candidate);
            }
        }
    }

    heap.into_iter().map(|Reverse(neighbor)| neighbor).collect()
}

/// Finds the `num_results` rows of `index` most similar to `query`.
///
/// Results are sorted by descending score and labelled with `repo_name` and
/// `revision`. An empty index or `num_results == 0` yields no results.
#[allow(clippy::too_many_arguments)]
pub fn similarity_search(
    index: &EmbeddingIndex,
    kernel: &dyn DotKernel,
    query: &[i8],
    num_results: usize,
    workers: WorkerOptions,
    opts: SearchOptions,
    repo_name: &str,
    revision: &str,
) -> Vec<EmbeddingSearchResult> {
    let num_rows = index.len();
    let num_results = num_results.min(num_rows);
    if num_results == 0 {
        return Vec::new();
    }

    let ranges = split_rows(num_rows, workers.num_workers, workers.min_rows_to_split);
    debug!(
        repo = repo_name,
        rows = num_rows,
        ranges = ranges.len(),
        "running similarity search"
    );

    let mut neighbors: Vec<NearestNeighbor> = if ranges.len() == 1 {
        partial_search(index, kernel, query, num_results, ranges[0], opts)
    } else {
        ranges
            .par_iter()
            .map(|&rows| partial_search(index, kernel, query, num_results, rows, opts))
            .flatten_iter()
            .collect()
    };

    neighbors.sort_unstable_by(|a, b| b.cmp(a));
    neighbors.truncate(num_results);

    neighbors
        .into_iter()
        .map(|neighbor| {
            let metadata = &index.row_metadata[neighbor.row];
            EmbeddingSearchResult {
                repo_name: repo_name.to_string(),
                revision: revision.to_string(),
                file_name: metadata.file_name.clone(),
                start_line: metadata.start_line,
                end_line: metadata.end_line,
                score: neighbor.score_details.score,
                similarity_score: neighbor.score_details.similarity,
                rank_score: neighbor.score_details.rank,
            }
        })
        .collect()
}
