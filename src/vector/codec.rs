//! Binary encoding of repository embedding indexes.
//!
//! # Format
//!
//! Values are written back to back with bincode's standard configuration.
//!
//! Current layout (version 1, model-tagged):
//! - Header: magic bytes `EMBI` followed by the format version (`u32`)
//! - `repo_name`, `revision`, `embeddings_model`
//! - For the code index, then the text index: `column_dimension`,
//!   `row_metadata`, `ranks`, chunk count, then that many `Vec<f32>` chunks
//!   of at most [`EMBEDDINGS_CHUNK_SIZE`] dequantized values
//!
//! Legacy layout (no header): `repo_name`, `revision`, then per index the
//! whole dequantized embedding matrix, `column_dimension` and `row_metadata`.
//!
//! Chunking keeps both sides from materializing the full float matrix: the
//! encoder dequantizes one chunk at a time and the decoder re-quantizes each
//! chunk as it arrives.

use std::io::{self, Read, Seek, SeekFrom, Write};

use bincode::config::{Configuration, standard};
use bincode::{Decode, Encode};
use thiserror::Error;
use tracing::debug;

use crate::vector::{
    EmbeddingIndex, RepoEmbeddingIndex, RowMetadata, VectorError, dequantize, quantize,
};

/// Magic bytes opening every versioned index stream.
const FORMAT_MAGIC: &[u8; 4] = b"EMBI";

/// Newest format version this build reads and the one it writes.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Maximum number of float values per encoded chunk.
pub const EMBEDDINGS_CHUNK_SIZE: usize = 10_000;

/// Errors specific to encoding and decoding indexes.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode index: {0}\nSuggestion: Check disk space and the target stream")]
    Encode(#[from] bincode::error::EncodeError),

    #[error(
        "Failed to decode index: {0}\nSuggestion: The stored index may be truncated or corrupted, reindex the repository"
    )]
    Decode(#[from] bincode::error::DecodeError),

    #[error(
        "Unrecognized index format version {found} (newest supported: {supported})\nSuggestion: Upgrade this service to a release that understands the stored format"
    )]
    UnrecognizedVersion { found: u32, supported: u32 },

    #[error(
        "Index format version {found} is no longer readable\nSuggestion: Reindex the repository to write the current format"
    )]
    RetiredVersion { found: u32 },

    #[error(
        "Malformed index stream: {0}\nSuggestion: The stored index is corrupted, reindex the repository"
    )]
    Malformed(String),

    #[error("Decoded index failed validation: {0}")]
    Invalid(#[from] VectorError),
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

fn config() -> Configuration {
    standard()
}

fn write_value<W: Write, T: Encode>(writer: &mut W, value: &T) -> CodecResult<()> {
    bincode::encode_into_std_write(value, writer, config())?;
    Ok(())
}

fn read_value<R: Read, T: Decode<()>>(reader: &mut R) -> CodecResult<T> {
    Ok(bincode::decode_from_std_read(reader, config())?)
}

/// Encodes `index` with the current format.
pub fn encode<W: Write>(mut writer: W, index: &RepoEmbeddingIndex) -> CodecResult<()> {
    writer.write_all(FORMAT_MAGIC)?;
    write_value(&mut writer, &CURRENT_FORMAT_VERSION)?;

    write_value(&mut writer, &index.repo_name)?;
    write_value(&mut writer, &index.revision)?;
    write_value(&mut writer, &index.embeddings_model)?;

    encode_index(&mut writer, &index.code_index)?;
    encode_index(&mut writer, &index.text_index)?;
    writer.flush()?;
    Ok(())
}

fn encode_index<W: Write>(writer: &mut W, index: &EmbeddingIndex) -> CodecResult<()> {
    write_value(writer, &(index.column_dimension as u64))?;
    write_value(writer, &index.row_metadata)?;
    write_value(writer, &index.ranks)?;

    let chunk_count = index.embeddings.len().div_ceil(EMBEDDINGS_CHUNK_SIZE);
    write_value(writer, &(chunk_count as u64))?;
    for chunk in index.embeddings.chunks(EMBEDDINGS_CHUNK_SIZE) {
        write_value(writer, &dequantize(chunk))?;
    }
    Ok(())
}

/// Encodes `index` with the legacy headerless layout.
///
/// Model tags and ranks are not representable there and are dropped. Kept so
/// migration tooling and tests can produce legacy streams.
pub fn encode_legacy<W: Write>(mut writer: W, index: &RepoEmbeddingIndex) -> CodecResult<()> {
    write_value(&mut writer, &index.repo_name)?;
    write_value(&mut writer, &index.revision)?;
    for part in [&index.code_index, &index.text_index] {
        write_value(&mut writer, &dequantize(&part.embeddings))?;
        write_value(&mut writer, &(part.column_dimension as u64))?;
        write_value(&mut writer, &part.row_metadata)?;
    }
    writer.flush()?;
    Ok(())
}

/// Decodes an index written in any supported format and validates it.
///
/// A stream without the version header is decoded with the legacy layout
/// from its starting position. A header naming a newer version is an error.
///
/// Every length prefix is checked against the bytes left in the stream
/// before anything is allocated, so a corrupted blob fails with
/// [`CodecError::Malformed`] instead of exhausting memory.
pub fn decode<R: Read + Seek>(mut reader: R) -> CodecResult<RepoEmbeddingIndex> {
    let start = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(start))?;
    let stream_len = end.saturating_sub(start);

    let mut bounded = BoundedReader::new(reader, stream_len);
    let index = match read_version(&mut bounded) {
        Some(version) => {
            if version > CURRENT_FORMAT_VERSION {
                return Err(CodecError::UnrecognizedVersion {
                    found: version,
                    supported: CURRENT_FORMAT_VERSION,
                });
            }
            if version < CURRENT_FORMAT_VERSION {
                return Err(CodecError::RetiredVersion { found: version });
            }
            decode_current(&mut bounded)?
        }
        None => {
            debug!("index stream has no version header, decoding legacy layout");
            let mut reader = bounded.into_inner();
            reader.seek(SeekFrom::Start(start))?;
            decode_legacy(&mut BoundedReader::new(reader, stream_len))?
        }
    };

    index.validate()?;
    Ok(index)
}

/// Reader that tracks how many bytes of the stream are left.
struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    fn new(inner: R, remaining: u64) -> Self {
        Self { inner, remaining }
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let read = self.inner.read(&mut buf[..max])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}

/// Reads the version header, `None` if the stream does not start with one.
fn read_version<R: Read>(reader: &mut R) -> Option<u32> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).ok()?;
    if &magic != FORMAT_MAGIC {
        return None;
    }
    read_value(reader).ok()
}

/// Reads a container length whose items take at least `min_item_bytes`
/// each on the wire, rejecting lengths the rest of the stream cannot hold.
fn read_len<R: Read>(reader: &mut BoundedReader<R>, min_item_bytes: u64) -> CodecResult<usize> {
    let len: u64 = read_value(reader)?;
    if len.saturating_mul(min_item_bytes) > reader.remaining {
        return Err(CodecError::Malformed(format!(
            "length prefix {len} exceeds the {} bytes left in the stream",
            reader.remaining
        )));
    }
    usize::try_from(len)
        .map_err(|_| CodecError::Malformed(format!("length prefix {len} does not fit in memory")))
}

fn read_string<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<String> {
    let len = read_len(reader, 1)?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Reads a `Vec<f32>`, stored as fixed-width little-endian values.
fn read_floats<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<Vec<f32>> {
    let len = read_len(reader, 4)?;
    let mut bytes = vec![0u8; len * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn read_row_metadata<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<Vec<RowMetadata>> {
    // File name length prefix plus two line numbers
    let len = read_len(reader, 3)?;
    let mut rows = Vec::with_capacity(len);
    for _ in 0..len {
        let file_name = read_string(reader)?;
        let start_line = read_value(reader)?;
        let end_line = read_value(reader)?;
        rows.push(RowMetadata {
            file_name,
            start_line,
            end_line,
        });
    }
    Ok(rows)
}

fn decode_current<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<RepoEmbeddingIndex> {
    let repo_name = read_string(reader)?;
    let revision = read_string(reader)?;
    let embeddings_model = read_string(reader)?;
    let code_index = decode_chunked_index(reader)?;
    let text_index = decode_chunked_index(reader)?;

    Ok(RepoEmbeddingIndex {
        repo_name,
        revision,
        embeddings_model,
        code_index,
        text_index,
    })
}

fn decode_chunked_index<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<EmbeddingIndex> {
    let column_dimension = read_dimension(reader)?;
    let row_metadata = read_row_metadata(reader)?;
    let ranks = read_floats(reader)?;
    let chunk_count: u64 = read_value(reader)?;

    // Every float still to come takes four bytes
    let expected = row_metadata.len().saturating_mul(column_dimension);
    let bounded = usize::try_from(reader.remaining / 4).unwrap_or(usize::MAX);
    let mut embeddings = Vec::with_capacity(expected.min(bounded));

    let mut buffer = None;
    for _ in 0..chunk_count {
        let chunk = read_floats(reader)?;
        if chunk.len() > EMBEDDINGS_CHUNK_SIZE {
            return Err(CodecError::Malformed(format!(
                "embeddings chunk of {} values exceeds the limit of {EMBEDDINGS_CHUNK_SIZE}",
                chunk.len()
            )));
        }
        let quantized = quantize(&chunk, buffer.take());
        embeddings.extend_from_slice(&quantized);
        buffer = Some(quantized);
    }

    Ok(EmbeddingIndex {
        embeddings,
        column_dimension,
        row_metadata,
        ranks,
    })
}

fn decode_legacy<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<RepoEmbeddingIndex> {
    let repo_name = read_string(reader)?;
    let revision = read_string(reader)?;
    let code_index = decode_legacy_index(reader)?;
    let text_index = decode_legacy_index(reader)?;

    Ok(RepoEmbeddingIndex {
        repo_name,
        revision,
        embeddings_model: String::new(),
        code_index,
        text_index,
    })
}

fn decode_legacy_index<R: Read>(reader: &mut BoundedReader<R>) -> CodecResult<EmbeddingIndex> {
    let embeddings = read_floats(reader)?;
    let column_dimension = read_dimension(reader)?;
    let row_metadata = read_row_metadata(reader)?;

    Ok(EmbeddingIndex {
        embeddings: quantize(&embeddings, None),
        column_dimension,
        row_metadata,
        ranks: Vec::new(),
    })
}

fn read_dimension<R: Read>(reader: &mut R) -> CodecResult<usize> {
    let dimension: u64 = read_value(reader)?;
    usize::try_from(dimension).map_err(|_| {
        CodecError::Malformed(format!("column dimension {dimension} does not fit in memory"))
    })
}
