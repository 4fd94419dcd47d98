//! Lossy float32 to int8 compression of embedding vectors.
//!
//! Values are clamped to `[-1, 1]` and mapped linearly onto `[-127, 127]`
//! with round-to-nearest. `-128` is never produced, which keeps the SIMD
//! multiply-add paths symmetric.

/// Scale between the float and the quantized domain.
pub const QUANTIZATION_SCALE: f32 = 127.0;

/// Quantizes `input` into int8, reusing `reuse` when its capacity suffices.
///
/// The buffer only saves an allocation: output is identical whether or not
/// one is supplied. Out-of-range values are clamped, never rejected.
#[must_use]
pub fn quantize(input: &[f32], reuse: Option<Vec<i8>>) -> Vec<i8> {
    let mut output = match reuse {
        Some(mut buffer) if buffer.capacity() >= input.len() => {
            buffer.clear();
            buffer
        }
        _ => Vec::with_capacity(input.len()),
    };
    output.extend(input.iter().map(|&value| quantize_value(value)));
    output
}

#[inline]
fn quantize_value(value: f32) -> i8 {
    // NaN clamps to NaN, and `as` saturates it to 0
    (value.clamp(-1.0, 1.0) * QUANTIZATION_SCALE).round() as i8
}

/// Inverse of [`quantize`]: maps each value back with `v / 127`.
#[must_use]
pub fn dequantize(input: &[i8]) -> Vec<f32> {
    input
        .iter()
        .map(|&value| f32::from(value) / QUANTIZATION_SCALE)
        .collect()
}
