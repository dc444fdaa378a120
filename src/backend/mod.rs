//! Math backend seam for the quantized convolution.
//!
//! The convolution driver only needs a handful of numeric primitives: packing
//! the filter for GEMM, the u8 x u8/i8 GEMM itself, the depthwise kernel, a
//! byte transpose and requantization. They sit behind [`QuantBackend`] so a
//! target-specific implementation can replace [`CpuBackend`].

#[cfg(target_arch = "x86_64")]
pub mod avx;
pub mod cpu;

pub use cpu::CpuBackend;

/// The B operand of a quantized GEMM.
#[derive(Debug, Clone, Copy)]
pub enum GemmB<'a> {
    /// Opaque block produced by [`QuantBackend::gemm_pack_b`].
    Packed(&'a [u8]),
    /// Row-major `[K, N]` bytes with row stride `ldb`.
    Raw { data: &'a [u8], ldb: usize },
}

/// `C[M, N] = (A[M, K] - zero_point_a) x (B[K, N] - zero_point_b)`, int32 accumulation.
#[derive(Debug, Clone, Copy)]
pub struct GemmU8X8Params<'a> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub a: &'a [u8],
    pub lda: usize,
    pub zero_point_a: u8,
    pub b: GemmB<'a>,
    /// Already widened according to `b_is_signed`.
    pub zero_point_b: i32,
    pub b_is_signed: bool,
    pub ldc: usize,
}

pub trait QuantBackend: Send + Sync {
    /// Bytes needed to pack a `[K, N]` B operand; 0 when packing is not supported.
    fn gemm_pack_b_size(&self, n: usize, k: usize, b_is_signed: bool) -> usize;

    fn gemm_pack_b(
        &self,
        n: usize,
        k: usize,
        b: &[u8],
        ldb: usize,
        b_is_signed: bool,
        packed: &mut [u8],
    );

    /// Overwrites `c[i * ldc + j]` for `i < m`, `j < n`.
    fn gemm(&self, params: &GemmU8X8Params<'_>, c: &mut [i32]);

    /// Depthwise convolution over `output_count` positions.
    ///
    /// `indirection[p * kernel_size + k]` is the `channels`-wide input row feeding
    /// tap `k` of output position `p`. `filter` is laid out `[kernel_size, channels]`.
    #[allow(clippy::too_many_arguments)]
    fn conv_depthwise(
        &self,
        indirection: &[&[u8]],
        x_zero_point: u8,
        filter: &[u8],
        w_zero_point: i32,
        w_is_signed: bool,
        out: &mut [i32],
        channels: usize,
        output_count: usize,
        kernel_size: usize,
    );

    /// `output[j * rows + i] = input[i * cols + j]`
    fn transpose(&self, input: &[u8], output: &mut [u8], rows: usize, cols: usize);

    #[allow(clippy::too_many_arguments)]
    fn requantize_output(
        &self,
        acc: &[i32],
        out: &mut [u8],
        bias: Option<&[i32]>,
        rows: usize,
        cols: usize,
        scales: &[f32],
        per_column: bool,
        zero_point: u8,
    ) {
        crate::kernels::requantize::requantize_output(
            acc, out, bias, rows, cols, scales, per_column, zero_point,
        );
    }
}
