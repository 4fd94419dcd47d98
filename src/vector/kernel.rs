//! Dot-product kernels over quantized embedding rows.
//!
//! Kernel selection happens once at startup through [`detect_kernel`], which
//! probes CPU capabilities and returns a shared strategy object. The search
//! path receives that object explicitly; nothing reassigns it afterwards.
//!
//! All kernels use wrapping i32 arithmetic. Sums near the i32 limits wrap to
//! a deterministic value instead of panicking, and every backend wraps the
//! same way so results stay comparable across kernels.

use std::sync::Arc;

use tracing::info;

/// Width of the block handed to accelerated backends. The remainder always
/// goes through the portable path.
pub const SIMD_BLOCK: usize = 64;

/// Computes similarity between two equal-length quantized vectors.
pub trait DotKernel: Send + Sync + std::fmt::Debug {
    /// Sum of elementwise products.
    ///
    /// # Panics
    /// Panics if `a` and `b` differ in length. That is an upstream bug, not an
    /// input error.
    fn dot(&self, a: &[i8], b: &[i8]) -> i32;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Portable kernel, processes four lanes per iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableKernel;

impl DotKernel for PortableKernel {
    fn dot(&self, a: &[i8], b: &[i8]) -> i32 {
        assert_eq!(a.len(), b.len(), "dot product of vectors with different lengths");
        dot_portable(a, b)
    }

    fn name(&self) -> &'static str {
        "portable"
    }
}

/// Portable int8 dot product, four independent accumulators.
#[must_use]
pub fn dot_portable(a: &[i8], b: &[i8]) -> i32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    let mut sums = [0i32; 4];
    let mut chunks_a = a.chunks_exact(4);
    let mut chunks_b = b.chunks_exact(4);
    for (ca, cb) in (&mut chunks_a).zip(&mut chunks_b) {
        for lane in 0..4 {
            sums[lane] = sums[lane].wrapping_add(i32::from(ca[lane]) * i32::from(cb[lane]));
        }
    }

    let mut total = sums[0]
        .wrapping_add(sums[1])
        .wrapping_add(sums[2])
        .wrapping_add(sums[3]);
    for (&x, &y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
        total = total.wrapping_add(i32::from(x) * i32::from(y));
    }
    total
}

/// Float dot product with the same four-lane blocking. Used on
/// pre-quantization vectors for comparison.
///
/// # Panics
/// Panics if `a` and `b` differ in length.
#[must_use]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "dot product of vectors with different lengths");

    let mut sums = [0f32; 4];
    let mut chunks_a = a.chunks_exact(4);
    let mut chunks_b = b.chunks_exact(4);
    for (ca, cb) in (&mut chunks_a).zip(&mut chunks_b) {
        for lane in 0..4 {
            sums[lane] += ca[lane] * cb[lane];
        }
    }

    let mut total = sums[0] + sums[1] + sums[2] + sums[3];
    for (&x, &y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
        total += x * y;
    }
    total
}

/// Vector instruction set used by [`SimdKernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdBackend {
    /// AVX2, 32 lanes per step
    Avx2,
    /// ARM NEON, 16 lanes per step
    Neon,
}

impl SimdBackend {
    /// Probes the running CPU for the best supported backend.
    #[must_use]
    pub fn detect() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                return Some(Self::Avx2);
            }
        }
        // NEON is part of the aarch64 baseline
        if cfg!(target_arch = "aarch64") {
            return Some(Self::Neon);
        }
        None
    }

    /// Whether this backend can run on the current CPU.
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            Self::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(target_arch = "aarch64")]
            Self::Neon => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Dot product over a block whose length is a multiple of [`SIMD_BLOCK`].
    fn dot_block(self, a: &[i8], b: &[i8]) -> i32 {
        debug_assert_eq!(a.len() % SIMD_BLOCK, 0);
        match self {
            // SAFETY: SimdKernel::new only accepts supported backends
            #[cfg(target_arch = "x86_64")]
            Self::Avx2 => unsafe { dot_avx2(a, b) },
            #[cfg(target_arch = "aarch64")]
            Self::Neon => unsafe { dot_neon(a, b) },
            #[allow(unreachable_patterns)]
            _ => dot_portable(a, b),
        }
    }
}

/// Kernel that routes 64-aligned blocks to a vector backend and sums the
/// scalar remainder on top.
#[derive(Debug, Clone, Copy)]
pub struct SimdKernel {
    backend: SimdBackend,
}

impl SimdKernel {
    /// Returns `None` when the backend is not available on this CPU.
    #[must_use]
    pub fn new(backend: SimdBackend) -> Option<Self> {
        backend.is_supported().then_some(Self { backend })
    }

    #[must_use]
    pub fn backend(&self) -> SimdBackend {
        self.backend
    }
}

impl DotKernel for SimdKernel {
    fn dot(&self, a: &[i8], b: &[i8]) -> i32 {
        assert_eq!(a.len(), b.len(), "dot product of vectors with different lengths");
        let block = a.len() - a.len() % SIMD_BLOCK;
        let head = if block > 0 {
            self.backend.dot_block(&a[..block], &b[..block])
        } else {
            0
        };
        head.wrapping_add(dot_portable(&a[block..], &b[block..]))
    }

    fn name(&self) -> &'static str {
        match self.backend {
            SimdBackend::Avx2 => "avx2",
            SimdBackend::Neon => "neon",
        }
    }
}

/// Probes the CPU once and returns the fastest available kernel.
///
/// Falls back to [`PortableKernel`] when no vector backend is available.
#[must_use]
pub fn detect_kernel() -> Arc<dyn DotKernel> {
    let kernel: Arc<dyn DotKernel> = match SimdBackend::detect().and_then(SimdKernel::new) {
        Some(kernel) => Arc::new(kernel),
        None => Arc::new(PortableKernel),
    };
    info!(kernel = kernel.name(), "selected dot product kernel");
    kernel
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[i8], b: &[i8]) -> i32 {
    use std::arch::x86_64::*;

    let n = a.len().min(b.len());
    let mut sum = _mm256_setzero_si256();

    let mut i = 0;
    while i + 32 <= n {
        // SAFETY: i + 32 <= n keeps both unaligned loads in bounds
        let (va, vb) = unsafe {
            (
                _mm256_loadu_si256(a.as_ptr().add(i).cast::<__m256i>()),
                _mm256_loadu_si256(b.as_ptr().add(i).cast::<__m256i>()),
            )
        };

        let lo_a = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<0>(va));
        let lo_b = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<0>(vb));
        let hi_a = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<1>(va));
        let hi_b = _mm256_cvtepi8_epi16(_mm256_extracti128_si256::<1>(vb));

        sum = _mm256_add_epi32(sum, _mm256_madd_epi16(lo_a, lo_b));
        sum = _mm256_add_epi32(sum, _mm256_madd_epi16(hi_a, hi_b));

        i += 32;
    }

    let sum128 = _mm_add_epi32(
        _mm256_extracti128_si256::<0>(sum),
        _mm256_extracti128_si256::<1>(sum),
    );
    let sum64 = _mm_add_epi32(sum128, _mm_srli_si128::<8>(sum128));
    let sum32 = _mm_add_epi32(sum64, _mm_srli_si128::<4>(sum64));
    _mm_cvtsi128_si32(sum32).wrapping_add(dot_portable(&a[i..n], &b[i..n]))
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(a: &[i8], b: &[i8]) -> i32 {
    use std::arch::aarch64::*;

    let n = a.len().min(b.len());
    let mut sum = vdupq_n_s32(0);

    let mut i = 0;
    while i + 16 <= n {
        // SAFETY: i + 16 <= n keeps both loads in bounds
        let (va, vb) = unsafe { (vld1q_s8(a.as_ptr().add(i)), vld1q_s8(b.as_ptr().add(i))) };

        let lo_a = vmovl_s8(vget_low_s8(va));
        let lo_b = vmovl_s8(vget_low_s8(vb));
        let hi_a = vmovl_s8(vget_high_s8(va));
        let hi_b = vmovl_s8(vget_high_s8(vb));

        sum = vaddq_s32(sum, vmull_s16(vget_low_s16(lo_a), vget_low_s16(lo_b)));
        sum = vaddq_s32(sum, vmull_s16(vget_high_s16(lo_a), vget_high_s16(lo_b)));
        sum = vaddq_s32(sum, vmull_s16(vget_low_s16(hi_a), vget_low_s16(hi_b)));
        sum = vaddq_s32(sum, vmull_s16(vget_high_s16(hi_a), vget_high_s16(hi_b)));

        i += 16;
    }

    // vaddvq_s32 wraps like the other backends
    vaddvq_s32(sum).wrapping_add(dot_portable(&a[i..n], &b[i..n]))
}
