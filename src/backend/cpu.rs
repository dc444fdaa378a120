use super::{GemmB, GemmU8X8Params, QuantBackend};
use crate::tensor::widen_weight;

const PACK_K_ALIGN: usize = 16;

/// Portable backend with an AVX2 path for the packed GEMM.
///
/// Packed B layout, per call to [`QuantBackend::gemm_pack_b`]:
/// `N` columns of `round_up(K, 16)` bytes each, every byte re-biased into the
/// signed domain (`b - 128` for unsigned filters, unchanged for signed ones),
/// zero-filled past `K`; then `N` little-endian i32 sums of the original
/// column values, used for the zero-point correction.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    packing: bool,
    #[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
    use_avx2: bool,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        #[cfg(target_arch = "x86_64")]
        let use_avx2 = is_x86_feature_detected!("avx2");
        #[cfg(not(target_arch = "x86_64"))]
        let use_avx2 = false;
        Self {
            packing: true,
            use_avx2,
        }
    }

    /// Backend that reports packing as unsupported (pack size 0).
    pub fn without_packing() -> Self {
        Self {
            packing: false,
            ..Self::new()
        }
    }

    /// Disable SIMD kernels, e.g. to cross-check them against the scalar code.
    pub fn scalar() -> Self {
        Self {
            use_avx2: false,
            ..Self::new()
        }
    }

    fn packed_k(k: usize) -> usize {
        (k + PACK_K_ALIGN - 1) / PACK_K_ALIGN * PACK_K_ALIGN
    }

    fn gemm_raw(&self, p: &GemmU8X8Params<'_>, data: &[u8], ldb: usize, c: &mut [i32]) {
        let za = p.zero_point_a as i32;
        for i in 0..p.m {
            let a_row = &p.a[i * p.lda..i * p.lda + p.k];
            let c_row = &mut c[i * p.ldc..i * p.ldc + p.n];
            c_row.fill(0);
            for (kk, &av) in a_row.iter().enumerate() {
                let av = av as i32 - za;
                if av == 0 {
                    continue;
                }
                let b_row = &data[kk * ldb..kk * ldb + p.n];
                for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                    *cv += av * (widen_weight(bv, p.b_is_signed) - p.zero_point_b);
                }
            }
        }
    }

    fn gemm_packed(&self, p: &GemmU8X8Params<'_>, packed: &[u8], c: &mut [i32]) {
        let kp = Self::packed_k(p.k);
        let (columns, sums) = packed.split_at(p.n * kp);
        let col_sums: Vec<i32> = sums
            .chunks_exact(4)
            .take(p.n)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let za = p.zero_point_a as i32;
        let zb = p.zero_point_b;
        // Stored bytes are b - offset.
        let offset = if p.b_is_signed { 0 } else { 128 };
        let k_za_zb = p.k as i32 * za * zb;

        for i in 0..p.m {
            let a_row = &p.a[i * p.lda..i * p.lda + p.k];
            let c_row = &mut c[i * p.ldc..i * p.ldc + p.n];
            let row_sum: i32 = a_row.iter().map(|&v| v as i32).sum();
            // (a - za)(b - zb) summed = dot + row_sum * (offset - zb) - za * col_sum + K * za * zb
            let row_corr = row_sum * (offset - zb) + k_za_zb;
            let column = |j: usize| packed_column(columns, kp, p.k, j);

            let mut j = 0;
            #[cfg(target_arch = "x86_64")]
            if self.use_avx2 {
                while j + 4 <= p.n {
                    let dots = unsafe {
                        super::avx::dot4_u8_i8_avx2(
                            a_row,
                            column(j),
                            column(j + 1),
                            column(j + 2),
                            column(j + 3),
                        )
                    };
                    for (d, dot) in dots.iter().enumerate() {
                        c_row[j + d] = dot + row_corr - za * col_sums[j + d];
                    }
                    j += 4;
                }
                while j < p.n {
                    let dot = unsafe { super::avx::dot_u8_i8_avx2(a_row, column(j)) };
                    c_row[j] = dot + row_corr - za * col_sums[j];
                    j += 1;
                }
            }
            while j < p.n {
                let dot: i32 = a_row
                    .iter()
                    .zip(column(j))
                    .map(|(&av, &bv)| av as i32 * (bv as i8 as i32))
                    .sum();
                c_row[j] = dot + row_corr - za * col_sums[j];
                j += 1;
            }
        }
    }
}

#[inline]
fn packed_column(columns: &[u8], kp: usize, k: usize, j: usize) -> &[u8] {
    &columns[j * kp..j * kp + k]
}

impl QuantBackend for CpuBackend {
    fn gemm_pack_b_size(&self, n: usize, k: usize, _b_is_signed: bool) -> usize {
        if !self.packing || n == 0 || k == 0 {
            return 0;
        }
        n * (Self::packed_k(k) + std::mem::size_of::<i32>())
    }

    fn gemm_pack_b(
        &self,
        n: usize,
        k: usize,
        b: &[u8],
        ldb: usize,
        b_is_signed: bool,
        packed: &mut [u8],
    ) {
        let kp = Self::packed_k(k);
        let (columns, sums) = packed.split_at_mut(n * kp);
        let flip = if b_is_signed { 0x00 } else { 0x80 };
        for j in 0..n {
            let col = &mut columns[j * kp..(j + 1) * kp];
            let mut csum: i32 = 0;
            for kk in 0..k {
                let bv = b[kk * ldb + j];
                col[kk] = bv ^ flip;
                csum += widen_weight(bv, b_is_signed);
            }
            col[k..].fill(0);
            sums[j * 4..j * 4 + 4].copy_from_slice(&csum.to_le_bytes());
        }
    }

    fn gemm(&self, params: &GemmU8X8Params<'_>, c: &mut [i32]) {
        if params.m == 0 || params.n == 0 {
            return;
        }
        match params.b {
            GemmB::Packed(packed) => self.gemm_packed(params, packed, c),
            GemmB::Raw { data, ldb } => self.gemm_raw(params, data, ldb, c),
        }
    }

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
    ) {
        let xz = x_zero_point as i32;
        for p in 0..output_count {
            let acc = &mut out[p * channels..(p + 1) * channels];
            acc.fill(0);
            let taps = &indirection[p * kernel_size..(p + 1) * kernel_size];
            for (k, row) in taps.iter().enumerate() {
                let w_row = &filter[k * channels..(k + 1) * channels];
                for c in 0..channels {
                    acc[c] += (row[c] as i32 - xz) * (widen_weight(w_row[c], w_is_signed) - w_zero_point);
                }
            }
        }
    }

    fn transpose(&self, input: &[u8], output: &mut [u8], rows: usize, cols: usize) {
        const BLOCK: usize = 16;
        for i0 in (0..rows).step_by(BLOCK) {
            let i1 = (i0 + BLOCK).min(rows);
            for j0 in (0..cols).step_by(BLOCK) {
                let j1 = (j0 + BLOCK).min(cols);
                for i in i0..i1 {
                    for j in j0..j1 {
                        output[j * rows + i] = input[i * cols + j];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_gemm(a: &[u8], b: &[u8], m: usize, n: usize, k: usize, za: u8, zb: i32, signed: bool) -> Vec<i32> {
        let mut c = vec![0; m * n];
        for i in 0..m {
            for j in 0..n {
                for kk in 0..k {
                    c[i * n + j] += (a[i * k + kk] as i32 - za as i32) * (widen_weight(b[kk * n + j], signed) - zb);
                }
            }
        }
        c
    }

    fn run(backend: &CpuBackend, signed: bool, packed: bool) {
        let (m, n, k) = (5, 7, 19);
        let a: Vec<u8> = (0..m * k).map(|i| (i * 31 % 251) as u8).collect();
        let b: Vec<u8> = (0..k * n).map(|i| (i * 17 % 253) as u8).collect();
        let (za, zb) = (9u8, if signed { -4 } else { 130 });
        let mut packed_buf = Vec::new();
        let b_op = if packed {
            packed_buf = vec![0u8; backend.gemm_pack_b_size(n, k, signed)];
            backend.gemm_pack_b(n, k, &b, n, signed, &mut packed_buf);
            GemmB::Packed(&packed_buf)
        } else {
            GemmB::Raw { data: &b, ldb: n }
        };
        let params = GemmU8X8Params {
            m,
            n,
            k,
            a: &a,
            lda: k,
            zero_point_a: za,
            b: b_op,
            zero_point_b: zb,
            b_is_signed: signed,
            ldc: n,
        };
        let mut c = vec![0; m * n];
        backend.gemm(&params, &mut c);
        assert_eq!(c, naive_gemm(&a, &b, m, n, k, za, zb, signed));
    }

    #[test]
    fn test_gemm_raw_and_packed_agree() {
        for backend in [CpuBackend::new(), CpuBackend::scalar()] {
            for signed in [false, true] {
                run(&backend, signed, false);
                run(&backend, signed, true);
            }
        }
    }

    #[test]
    fn test_without_packing_reports_zero() {
        assert_eq!(CpuBackend::without_packing().gemm_pack_b_size(8, 8, false), 0);
        assert_eq!(CpuBackend::new().gemm_pack_b_size(8, 8, false), 8 * (16 + 4));
    }

    #[test]
    fn test_transpose() {
        let input: Vec<u8> = (0..6).collect();
        let mut out = vec![0u8; 6];
        CpuBackend::new().transpose(&input, &mut out, 2, 3);
        assert_eq!(out, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_depthwise_single_position() {
        let row0 = [10u8, 20];
        let row1 = [1u8, 2];
        let ind: Vec<&[u8]> = vec![&row0, &row1];
        let filter = [2u8, 3, 4, 5];
        let mut out = [0i32; 2];
        CpuBackend::new().conv_depthwise(&ind, 1, &filter, 1, false, &mut out, 2, 1, 2);
        // c0: 9*1 + 0*3 = 9, c1: 19*2 + 1*4 = 42
        assert_eq!(out, [9, 42]);
    }
}
