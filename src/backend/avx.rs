use std::arch::x86_64::*;

/// `sum(a[i] * (b[i] as i8))` over `a.len()` elements.
///
/// `b` holds signed bytes. Both operands are widened to i16 and fed through
/// VPMADDWD, so no intermediate saturates.
#[target_feature(enable = "avx2")]
pub unsafe fn dot_u8_i8_avx2(a: &[u8], b: &[u8]) -> i32 {
    let len = a.len();
    debug_assert!(b.len() >= len);
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();
    let mut iacc = _mm256_setzero_si256();
    let mut kk = 0;
    while kk + 16 <= len {
        let va = _mm256_cvtepu8_epi16(_mm_loadu_si128(a_ptr.add(kk) as *const __m128i));
        let vb = _mm256_cvtepi8_epi16(_mm_loadu_si128(b_ptr.add(kk) as *const __m128i));
        iacc = _mm256_add_epi32(iacc, _mm256_madd_epi16(va, vb));
        kk += 16;
    }
    let mut sum = hsum_epi32(iacc);
    while kk < len {
        sum += *a_ptr.add(kk) as i32 * (*b_ptr.add(kk) as i8 as i32);
        kk += 1;
    }
    sum
}

/// Four packed columns against one A row; amortizes the A loads.
#[target_feature(enable = "avx2")]
pub unsafe fn dot4_u8_i8_avx2(a: &[u8], b0: &[u8], b1: &[u8], b2: &[u8], b3: &[u8]) -> [i32; 4] {
    let len = a.len();
    debug_assert!(b0.len() >= len && b1.len() >= len && b2.len() >= len && b3.len() >= len);
    let a_ptr = a.as_ptr();
    let mut iacc0 = _mm256_setzero_si256();
    let mut iacc1 = _mm256_setzero_si256();
    let mut iacc2 = _mm256_setzero_si256();
    let mut iacc3 = _mm256_setzero_si256();
    let mut kk = 0;
    while kk + 16 <= len {
        let va = _mm256_cvtepu8_epi16(_mm_loadu_si128(a_ptr.add(kk) as *const __m128i));
        let vb0 = _mm256_cvtepi8_epi16(_mm_loadu_si128(b0.as_ptr().add(kk) as *const __m128i));
        let vb1 = _mm256_cvtepi8_epi16(_mm_loadu_si128(b1.as_ptr().add(kk) as *const __m128i));
        let vb2 = _mm256_cvtepi8_epi16(_mm_loadu_si128(b2.as_ptr().add(kk) as *const __m128i));
        let vb3 = _mm256_cvtepi8_epi16(_mm_loadu_si128(b3.as_ptr().add(kk) as *const __m128i));
        iacc0 = _mm256_add_epi32(iacc0, _mm256_madd_epi16(va, vb0));
        iacc1 = _mm256_add_epi32(iacc1, _mm256_madd_epi16(va, vb1));
        iacc2 = _mm256_add_epi32(iacc2, _mm256_madd_epi16(va, vb2));
        iacc3 = _mm256_add_epi32(iacc3, _mm256_madd_epi16(va, vb3));
        kk += 16;
    }
    let mut sums = [
        hsum_epi32(iacc0),
        hsum_epi32(iacc1),
        hsum_epi32(iacc2),
        hsum_epi32(iacc3),
    ];
    while kk < len {
        let av = *a_ptr.add(kk) as i32;
        sums[0] += av * (b0[kk] as i8 as i32);
        sums[1] += av * (b1[kk] as i8 as i32);
        sums[2] += av * (b2[kk] as i8 as i32);
        sums[3] += av * (b3[kk] as i8 as i32);
        kk += 1;
    }
    sums
}

/// Horizontal sum of 8 x i32 in __m256i -> single i32
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn hsum_epi32(v: __m256i) -> i32 {
    let hi128 = _mm256_extracti128_si256(v, 1);
    let lo128 = _mm256_castsi256_si128(v);
    let sum128 = _mm_add_epi32(lo128, hi128);
    let hi64 = _mm_unpackhi_epi64(sum128, sum128);
    let sum64 = _mm_add_epi32(sum128, hi64);
    let hi32 = _mm_shuffle_epi32(sum64, 1);
    let sum32 = _mm_add_epi32(sum64, hi32);
    _mm_cvtsi128_si32(sum32)
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_dot_matches_scalar() {
        if !is_x86_feature_detected!("avx2") {
            return;
        }
        let a: Vec<u8> = (0..37).map(|i| (i * 7 % 256) as u8).collect();
        let b: Vec<u8> = (0..37).map(|i| (i * 13 % 256) as u8).collect();
        let expected: i32 = a.iter().zip(&b).map(|(&x, &y)| x as i32 * (y as i8 as i32)).sum();
        assert_eq!(unsafe { dot_u8_i8_avx2(&a, &b) }, expected);
        let got = unsafe { dot4_u8_i8_avx2(&a, &b, &b, &a, &b) };
        let expected_a: i32 = a.iter().map(|&x| x as i32 * (x as i8 as i32)).sum();
        assert_eq!(got, [expected, expected, expected_a, expected]);
    }
}
