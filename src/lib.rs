//! In-process similarity search over quantized embedding indexes.
//!
//! - [`vector`]: quantization, dot kernels, index types, top-K search, codec
//! - [`storage`]: blob and job stores, the LRU index cache and its getter
//! - [`search`]: multi-repository search requests

pub mod config;
pub mod error;
pub mod search;
pub mod storage;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{SearchError, SearchResult};
pub use search::{EmbeddingsSearcher, QueryEmbedder, SearchRequest, SearchResponse};
pub use storage::{CachedIndexGetter, IndexCache, StorageError, StorageResult};
pub use vector::{
    CodecError, DotKernel, EmbeddingIndex, EmbeddingSearchResult, RepoEmbeddingIndex, RepoId,
    RowMetadata, VectorError,
};
