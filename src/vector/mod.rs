//! Quantized embedding indexes and similarity search.
//!
//! Embeddings are stored as int8 rows (see [`quantize`]) in a row-major
//! [`EmbeddingIndex`]. Searches scan every row with a [`DotKernel`] chosen at
//! startup, spread over a worker pool for large indexes.
//!
//! # Architecture
//! - `quantize`: float32 to int8 compression and back
//! - `kernel`: portable and SIMD dot products behind one strategy trait
//! - `index`: index types, validation, append and filter
//! - `search`: partitioned top-K search with rank blending
//! - `codec`: versioned chunked binary format with legacy fallback

mod codec;
mod index;
mod kernel;
mod quantize;
mod search;
mod types;

// Re-export core types for public API
pub use codec::{
    CURRENT_FORMAT_VERSION, CodecError, CodecResult, EMBEDDINGS_CHUNK_SIZE, decode, encode,
    encode_legacy,
};
pub use index::{EmbeddingIndex, ROW_METADATA_OVERHEAD, RankSource, RepoEmbeddingIndex, RowMetadata};
pub use kernel::{
    DotKernel, PortableKernel, SIMD_BLOCK, SimdBackend, SimdKernel, detect_kernel, dot_f32,
    dot_portable,
};
pub use quantize::{QUANTIZATION_SCALE, dequantize, quantize};
pub use search::{
    EmbeddingSearchResult, NearestNeighbor, PartialRows, RANK_WEIGHT, SIMILARITY_WEIGHT,
    SearchOptions, WorkerOptions, score_row, similarity_search, split_rows,
};
pub use types::{RepoId, ScoreDetails, VectorError};
