//! Test: similarity search results do not depend on the worker count
//!
//! Every partitioning of the rows must produce exactly the ranking of a
//! brute-force scan over the whole index.

use embsearch::vector::{
    DotKernel, EmbeddingIndex, PortableKernel, RowMetadata, SearchOptions, WorkerOptions,
    detect_kernel, quantize, score_row, similarity_search,
};
use rand::Rng;

const WORKER_COUNTS: [usize; 9] = [1, 2, 3, 5, 8, 9, 16, 20, 33];
const DIMENSION: usize = 24;

fn random_unit_vector(rng: &mut impl Rng, dimension: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect();
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
    raw.into_iter().map(|v| v / norm).collect()
}

fn random_index(rng: &mut impl Rng, rows: usize, with_ranks: bool) -> EmbeddingIndex {
    let mut index = EmbeddingIndex::new(DIMENSION);
    for row in 0..rows {
        let vector = quantize(&random_unit_vector(rng, DIMENSION), None);
        let rank = with_ranks.then(|| rng.random_range(0.0..40.0));
        index
            .push_row(&vector, RowMetadata::new(format!("file_{row}.go"), row as u32, row as u32 + 10), rank)
            .expect("row has the index dimension");
    }
    index
}

/// Reference ranking: score every row, order by score then row index.
fn brute_force(
    index: &EmbeddingIndex,
    kernel: &dyn DotKernel,
    query: &[i8],
    num_results: usize,
    opts: SearchOptions,
) -> Vec<(String, i32)> {
    let mut scored: Vec<(usize, i32)> = (0..index.len())
        .map(|row| (row, score_row(index, kernel, query, row, opts).score))
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(num_results)
        .map(|(row, score)| (index.row_metadata[row].file_name.clone(), score))
        .collect()
}

#[test]
fn test_worker_counts_match_brute_force() {
    let mut rng = rand::rng();
    let kernel = detect_kernel();

    for with_ranks in [false, true] {
        let index = random_index(&mut rng, 257, with_ranks);
        let opts = SearchOptions {
            use_document_ranks: with_ranks,
        };

        for _ in 0..5 {
            let query = quantize(&random_unit_vector(&mut rng, DIMENSION), None);
            for num_results in [1, 7, 40] {
                let expected = brute_force(&index, &PortableKernel, &query, num_results, opts);

                for num_workers in WORKER_COUNTS {
                    let workers = WorkerOptions {
                        num_workers,
                        min_rows_to_split: 0,
                    };
                    let actual: Vec<(String, i32)> = similarity_search(
                        &index,
                        kernel.as_ref(),
                        &query,
                        num_results,
                        workers,
                        opts,
                        "acme/app",
                        "abc123",
                    )
                    .into_iter()
                    .map(|r| (r.file_name, r.score))
                    .collect();

                    assert_eq!(
                        actual, expected,
                        "workers={num_workers} results={num_results} ranks={with_ranks}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_duplicate_rows_break_ties_by_row() {
    // Identical rows score identically, so only the row order decides
    let mut index = EmbeddingIndex::new(4);
    for row in 0..50 {
        index
            .push_row(&[10, 20, 30, 40], RowMetadata::new(format!("dup_{row}"), 0, 0), None)
            .expect("valid row");
    }
    let query = [1, 1, 1, 1];

    for num_workers in WORKER_COUNTS {
        let workers = WorkerOptions {
            num_workers,
            min_rows_to_split: 0,
        };
        let files: Vec<String> = similarity_search(
            &index,
            &PortableKernel,
            &query,
            5,
            workers,
            SearchOptions::default(),
            "r",
            "v",
        )
        .into_iter()
        .map(|r| r.file_name)
        .collect();
        assert_eq!(files, ["dup_0", "dup_1", "dup_2", "dup_3", "dup_4"], "workers={num_workers}");
    }
}

#[test]
fn test_more_results_than_rows() {
    let mut rng = rand::rng();
    let index = random_index(&mut rng, 6, false);
    let query = quantize(&random_unit_vector(&mut rng, DIMENSION), None);

    let results = similarity_search(
        &index,
        &PortableKernel,
        &query,
        100,
        WorkerOptions {
            num_workers: 4,
            min_rows_to_split: 0,
        },
        SearchOptions::default(),
        "r",
        "v",
    );
    assert_eq!(results.len(), 6);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
}
