//! Embeddings search across repositories.
//!
//! The query is embedded and quantized once, then every requested repository
//! index is fetched through the [`CachedIndexGetter`] and scanned for code and
//! text matches. Per-repository results are merged by descending score.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SearchError, SearchResult};
use crate::storage::{BlobStore, CachedIndexGetter, JobStore};
use crate::vector::{
    DotKernel, EmbeddingIndex, EmbeddingSearchResult, RepoId, SearchOptions, VectorError,
    WorkerOptions, quantize, similarity_search,
};

/// External service turning query text into an embedding.
pub trait QueryEmbedder: Send + Sync + 'static {
    fn embed(&self, text: &str) -> impl Future<Output = SearchResult<Vec<f32>>> + Send;

    /// Identifier of the model producing the embeddings.
    fn model(&self) -> &str;
}

/// Embedder returning one precomputed vector for every query.
#[derive(Debug, Clone)]
pub struct PrecomputedEmbedder {
    model: String,
    vector: Vec<f32>,
}

impl PrecomputedEmbedder {
    pub fn new(model: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            model: model.into(),
            vector,
        }
    }
}

impl QueryEmbedder for PrecomputedEmbedder {
    async fn embed(&self, _text: &str) -> SearchResult<Vec<f32>> {
        Ok(self.vector.clone())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query_text: String,
    pub repo_ids: Vec<RepoId>,
    /// Names matching `repo_ids` position by position
    pub repo_names: Vec<String>,
    pub code_result_count: usize,
    pub text_result_count: usize,
    #[serde(default)]
    pub use_document_ranks: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub code_results: Vec<EmbeddingSearchResult>,
    pub text_results: Vec<EmbeddingSearchResult>,
}

pub struct EmbeddingsSearcher<S, J, E> {
    getter: CachedIndexGetter<S, J>,
    embedder: Arc<E>,
    kernel: Arc<dyn DotKernel>,
    workers: WorkerOptions,
}

impl<S: BlobStore, J: JobStore, E: QueryEmbedder> EmbeddingsSearcher<S, J, E> {
    pub fn new(
        getter: CachedIndexGetter<S, J>,
        embedder: Arc<E>,
        kernel: Arc<dyn DotKernel>,
        workers: WorkerOptions,
    ) -> Self {
        Self {
            getter,
            embedder,
            kernel,
            workers,
        }
    }

    pub fn getter(&self) -> &CachedIndexGetter<S, J> {
        &self.getter
    }

    /// Runs `request` against every listed repository.
    ///
    /// The first failing repository fails the whole request.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        request: &SearchRequest,
    ) -> SearchResult<SearchResponse> {
        if request.repo_ids.len() != request.repo_names.len() {
            return Err(SearchError::InvalidRequest {
                reason: format!(
                    "{} repository ids but {} repository names",
                    request.repo_ids.len(),
                    request.repo_names.len()
                ),
            });
        }

        let embedding = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SearchError::Cancelled),
            embedding = self.embedder.embed(&request.query_text) => embedding?,
        };
        let query: Arc<[i8]> = quantize(&embedding, None).into();
        let opts = SearchOptions {
            use_document_ranks: request.use_document_ranks,
        };

        let mut response = SearchResponse::default();
        for (&repo_id, repo_name) in request.repo_ids.iter().zip(&request.repo_names) {
            let (code, text) = self
                .search_repo(cancel, repo_id, repo_name, &query, request, opts)
                .await?;
            response.code_results.extend(code);
            response.text_results.extend(text);
        }

        merge_results(&mut response.code_results, request.code_result_count);
        merge_results(&mut response.text_results, request.text_result_count);
        info!(
            repos = request.repo_ids.len(),
            code = response.code_results.len(),
            text = response.text_results.len(),
            "embeddings search finished"
        );
        Ok(response)
    }

    async fn search_repo(
        &self,
        cancel: &CancellationToken,
        repo_id: RepoId,
        repo_name: &str,
        query: &Arc<[i8]>,
        request: &SearchRequest,
        opts: SearchOptions,
    ) -> SearchResult<(Vec<EmbeddingSearchResult>, Vec<EmbeddingSearchResult>)> {
        let index = self
            .getter
            .get(cancel, repo_id, repo_name)
            .await
            .map_err(|e| SearchError::from_storage(e, repo_id, repo_name))?;

        if !index.is_model_compatible(self.embedder.model()) {
            return Err(SearchError::ModelMismatch {
                repo_name: repo_name.to_string(),
                index_model: index.embeddings_model.clone(),
                query_model: self.embedder.model().to_string(),
            });
        }
        check_dimension(&index.code_index, query)?;
        check_dimension(&index.text_index, query)?;

        debug!(
            repo = repo_name,
            code_rows = index.code_index.len(),
            text_rows = index.text_index.len(),
            "searching repository"
        );

        let kernel = Arc::clone(&self.kernel);
        let query = Arc::clone(query);
        let repo_name = repo_name.to_string();
        let workers = self.workers;
        let (code_count, text_count) = (request.code_result_count, request.text_result_count);

        // Scanning is CPU bound, keep it off the async workers
        let results = tokio::task::spawn_blocking(move || {
            let code = similarity_search(
                &index.code_index,
                kernel.as_ref(),
                &query,
                code_count,
                workers,
                opts,
                &repo_name,
                &index.revision,
            );
            let text = similarity_search(
                &index.text_index,
                kernel.as_ref(),
                &query,
                text_count,
                workers,
                opts,
                &repo_name,
                &index.revision,
            );
            (code, text)
        })
        .await?;
        Ok(results)
    }
}

fn check_dimension(index: &EmbeddingIndex, query: &[i8]) -> SearchResult<()> {
    if !index.is_empty() && index.column_dimension != query.len() {
        return Err(VectorError::DimensionMismatch {
            expected: index.column_dimension,
            actual: query.len(),
        }
        .into());
    }
    Ok(())
}

/// Sorts by descending score and keeps the best `count`. Ties keep their
/// per-repository order.
fn merge_results(results: &mut Vec<EmbeddingSearchResult>, count: usize) {
    results.sort_by(|a, b| b.score.cmp(&a.score));
    results.truncate(count);
}
