//! Channel-last (NHWC) im2col for the quantized convolution.
//!
//! Every output position becomes one row of `kernel_size * group_channels`
//! bytes, ordered `[kernel..., channel]` to match the reordered filter.
//! Taps that fall into padding are filled with the input zero point so they
//! contribute nothing after zero-point subtraction.

use crate::kernels::utils::{next_index, offset_to_indices};

/// Range `[start, end)` of kernel taps along one axis that land inside the input,
/// for a window whose first tap sits at `origin` (may be negative).
#[inline]
fn valid_tap_range(origin: isize, dilation: usize, kernel: usize, extent: usize) -> (usize, usize) {
    let d = dilation as isize;
    let start = if origin >= 0 { 0 } else { (-origin + d - 1) / d };
    let remaining = extent as isize - origin;
    let end = if remaining <= 0 { 0 } else { (remaining + d - 1) / d };
    let start = (start as usize).min(kernel);
    let end = (end as usize).min(kernel).max(start);
    (start, end)
}

/// 2-D im2col over the tile `[output_start, output_start + output_count)`.
///
/// `input` starts at the group's first channel; pixels are `input_channels`
/// bytes apart. Rank-1 kernels use this with `input_h == kernel_h == 1`.
#[allow(clippy::too_many_arguments)]
pub fn im2col_nhwc_2d(
    input: &[u8],
    group_channels: usize,
    input_channels: usize,
    input_h: usize,
    input_w: usize,
    kernel_h: usize,
    kernel_w: usize,
    dilation_h: usize,
    dilation_w: usize,
    pad_t: usize,
    pad_l: usize,
    stride_h: usize,
    stride_w: usize,
    output_w: usize,
    output_start: usize,
    output_count: usize,
    col: &mut [u8],
    padding_value: u8,
) {
    let gc = group_channels;
    let row_len = kernel_h * kernel_w * gc;
    if row_len == 0 || output_w == 0 {
        return;
    }
    // A full window row is one contiguous input span when it covers every channel.
    let contiguous = dilation_w == 1 && gc == input_channels;

    let mut oh = output_start / output_w;
    let mut ow = output_start % output_w;
    for row in col.chunks_exact_mut(row_len).take(output_count) {
        let ih0 = (oh * stride_h) as isize - pad_t as isize;
        let iw0 = (ow * stride_w) as isize - pad_l as isize;
        let (kw_start, kw_end) = valid_tap_range(iw0, dilation_w, kernel_w, input_w);

        for (kh, dst) in row.chunks_exact_mut(kernel_w * gc).enumerate() {
            let ih = ih0 + (kh * dilation_h) as isize;
            if ih < 0 || ih >= input_h as isize || kw_start == kw_end {
                dst.fill(padding_value);
                continue;
            }
            let in_row = ih as usize * input_w;

            dst[..kw_start * gc].fill(padding_value);
            if contiguous {
                let iw = (iw0 + kw_start as isize) as usize;
                let src = (in_row + iw) * input_channels;
                let count = (kw_end - kw_start) * gc;
                dst[kw_start * gc..kw_end * gc].copy_from_slice(&input[src..src + count]);
            } else {
                for kw in kw_start..kw_end {
                    let iw = (iw0 + (kw * dilation_w) as isize) as usize;
                    let src = (in_row + iw) * input_channels;
                    dst[kw * gc..(kw + 1) * gc].copy_from_slice(&input[src..src + gc]);
                }
            }
            dst[kw_end * gc..].fill(padding_value);
        }

        ow += 1;
        if ow == output_w {
            ow = 0;
            oh += 1;
        }
    }
}

/// Flat input pixel index for output position `out_idx` and tap `k_idx`,
/// or `None` when the tap lands in padding.
#[inline]
fn input_pixel(
    out_idx: &[usize],
    k_idx: &[usize],
    input_shape: &[usize],
    strides: &[usize],
    dilations: &[usize],
    pads: &[usize],
) -> Option<usize> {
    let mut flat = 0;
    for d in 0..input_shape.len() {
        let pos = (out_idx[d] * strides[d] + k_idx[d] * dilations[d]) as isize - pads[d] as isize;
        if pos < 0 || pos >= input_shape[d] as isize {
            return None;
        }
        flat = flat * input_shape[d] + pos as usize;
    }
    Some(flat)
}

/// N-D im2col for a whole image and one group. Used for kernels of rank 3 and up.
#[allow(clippy::too_many_arguments)]
pub fn im2col_nhwc_nd(
    input: &[u8],
    group_channels: usize,
    input_channels: usize,
    input_shape: &[usize],
    output_shape: &[usize],
    kernel_shape: &[usize],
    strides: &[usize],
    dilations: &[usize],
    pads: &[usize],
    col: &mut [u8],
    padding_value: u8,
) {
    let rank = kernel_shape.len();
    let gc = group_channels;
    let kernel_size: usize = kernel_shape.iter().product();
    let output_size: usize = output_shape.iter().product();
    let mut out_idx = vec![0usize; rank];
    let mut k_idx = vec![0usize; rank];

    let mut c = 0;
    for _ in 0..output_size {
        k_idx.fill(0);
        for _ in 0..kernel_size {
            let dst = &mut col[c..c + gc];
            match input_pixel(&out_idx, &k_idx, input_shape, strides, dilations, pads) {
                Some(pixel) => {
                    let src = pixel * input_channels;
                    dst.copy_from_slice(&input[src..src + gc]);
                }
                None => dst.fill(padding_value),
            }
            c += gc;
            next_index(&mut k_idx, kernel_shape);
        }
        next_index(&mut out_idx, output_shape);
    }
}

/// Depthwise indirection buffer for a tile: for every output position and
/// kernel tap, the `channels`-wide input pixel it reads, or `padding` (a row
/// filled with the input zero point) when the tap is out of bounds.
#[allow(clippy::too_many_arguments)]
pub fn build_indirection<'a>(
    input: &'a [u8],
    padding: &'a [u8],
    channels: usize,
    input_shape: &[usize],
    output_shape: &[usize],
    kernel_shape: &[usize],
    strides: &[usize],
    dilations: &[usize],
    pads: &[usize],
    output_start: usize,
    output_count: usize,
    indirection: &mut Vec<&'a [u8]>,
) {
    let rank = kernel_shape.len();
    let kernel_size: usize = kernel_shape.iter().product();
    indirection.clear();
    indirection.reserve(output_count * kernel_size);

    let mut out_idx = vec![0usize; rank];
    offset_to_indices(output_start, output_shape, &mut out_idx);
    let mut k_idx = vec![0usize; rank];
    for _ in 0..output_count {
        k_idx.fill(0);
        for _ in 0..kernel_size {
            let row = match input_pixel(&out_idx, &k_idx, input_shape, strides, dilations, pads) {
                Some(pixel) => &input[pixel * channels..(pixel + 1) * channels],
                None => padding,
            };
            indirection.push(row);
            next_index(&mut k_idx, kernel_shape);
        }
        next_index(&mut out_idx, output_shape);
    }
}
