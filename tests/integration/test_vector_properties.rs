//! Test: randomized properties of quantization, dot kernels and the codec

use std::io::Cursor;

use embsearch::vector::{
    DotKernel, EmbeddingIndex, RepoEmbeddingIndex, RowMetadata, SimdBackend, SimdKernel, decode,
    dequantize, detect_kernel, dot_portable, encode, encode_legacy, quantize,
};
use rand::Rng;

fn random_i8s(rng: &mut impl Rng, len: usize) -> Vec<i8> {
    (0..len).map(|_| rng.random::<i8>()).collect()
}

fn random_index(rng: &mut impl Rng, rows: usize, dimension: usize) -> EmbeddingIndex {
    let mut index = EmbeddingIndex::new(dimension);
    for row in 0..rows {
        let floats: Vec<f32> = (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect();
        let rank = (row % 3 != 0).then(|| rng.random_range(0.0..20.0));
        index
            .push_row(
                &quantize(&floats, None),
                RowMetadata::new(format!("dir/file_{row}.py"), row as u32, row as u32 + 5),
                rank,
            )
            .expect("valid row");
    }
    index
}

#[test]
fn test_quantize_round_trip_error_bound() {
    let mut rng = rand::rng();
    let input: Vec<f32> = (0..10_000).map(|_| rng.random_range(-1.0..=1.0)).collect();
    let restored = dequantize(&quantize(&input, None));
    for (original, restored) in input.iter().zip(&restored) {
        assert!(
            (original - restored).abs() <= 1.0 / 127.0,
            "{original} restored as {restored}"
        );
    }
}

#[test]
fn test_quantize_buffer_reuse_is_unobservable() {
    let mut rng = rand::rng();
    for _ in 0..200 {
        let len = rng.random_range(0..300);
        let input: Vec<f32> = (0..len).map(|_| rng.random_range(-2.0..2.0)).collect();
        let capacity = rng.random_range(0..400);
        let buffer = random_i8s(&mut rng, capacity);

        assert_eq!(quantize(&input, Some(buffer)), quantize(&input, None));
    }
}

#[test]
fn test_kernels_match_reference_on_random_vectors() {
    let mut rng = rand::rng();
    let detected = detect_kernel();
    let backends: Vec<SimdKernel> = [SimdBackend::Avx2, SimdBackend::Neon]
        .into_iter()
        .filter_map(SimdKernel::new)
        .collect();

    for _ in 0..300 {
        // Lengths deliberately straddle the 64-element block size
        let len = rng.random_range(0..700);
        let a = random_i8s(&mut rng, len);
        let b = random_i8s(&mut rng, len);
        let expected = dot_portable(&a, &b);

        assert_eq!(detected.dot(&a, &b), expected, "len={len} kernel={}", detected.name());
        for kernel in &backends {
            assert_eq!(kernel.dot(&a, &b), expected, "len={len} kernel={}", kernel.name());
        }
    }
}

#[test]
fn test_codec_round_trip_random_indexes() {
    let mut rng = rand::rng();
    for (rows, dimension) in [(0, 8), (1, 1536), (37, 64), (400, 50)] {
        let index = RepoEmbeddingIndex {
            repo_name: "github.com/acme/data".to_string(),
            revision: "0123456789abcdef".to_string(),
            embeddings_model: "openai/text-embedding-ada-002".to_string(),
            code_index: random_index(&mut rng, rows, dimension),
            text_index: random_index(&mut rng, rows / 2, dimension),
        };

        let mut bytes = Vec::new();
        encode(&mut bytes, &index).expect("encode");
        let decoded = decode(Cursor::new(bytes)).expect("decode");
        decoded.validate().expect("decoded index is valid");
        assert_eq!(decoded, index, "rows={rows} dimension={dimension}");
    }
}

#[test]
fn test_legacy_decode_drops_model_and_ranks() {
    let mut rng = rand::rng();
    let index = RepoEmbeddingIndex {
        repo_name: "acme/legacy".to_string(),
        revision: "r1".to_string(),
        embeddings_model: "ignored-by-legacy".to_string(),
        code_index: random_index(&mut rng, 25, 16),
        text_index: random_index(&mut rng, 4, 16),
    };

    let mut bytes = Vec::new();
    encode_legacy(&mut bytes, &index).expect("legacy encode");
    let decoded = decode(Cursor::new(bytes)).expect("legacy decode");

    assert!(decoded.embeddings_model.is_empty());
    assert!(decoded.code_index.ranks.is_empty());
    assert_eq!(decoded.code_index.embeddings, index.code_index.embeddings);
    assert_eq!(decoded.code_index.row_metadata, index.code_index.row_metadata);
    assert_eq!(decoded.text_index.embeddings, index.text_index.embeddings);
}
