use crate::backend::QuantBackend;
use crate::kernels::utils::shape_size;
use crate::tensor::WeightTensor;
use std::borrow::Cow;
use tracing::debug;

/// Reorder `[output_channels, input_channels, kernel]` into
/// `[kernel, input_channels, output_channels]` so the GEMM reduction runs
/// over the leading axis of B.
pub fn reorder_filter(
    input: &[u8],
    output: &mut [u8],
    output_channels: usize,
    input_channels: usize,
    kernel_size: usize,
) {
    debug_assert!(input.len() >= output_channels * input_channels * kernel_size);
    let mut o = 0;
    for k in 0..kernel_size {
        for ic in 0..input_channels {
            for oc in 0..output_channels {
                output[o] = input[(oc * input_channels + ic) * kernel_size + k];
                o += 1;
            }
        }
    }
}

/// Inference-ready filter storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterLayout {
    /// `[kernel, group_input_channels, M]` for all groups at once; group `g`
    /// starts at column `g * group_output_channels` with row stride `M`.
    Reordered(Vec<u8>),
    /// One backend-packed block per group, `group_stride` bytes apart.
    Packed { buffer: Vec<u8>, group_stride: usize },
}

/// A constant filter prepared once and reused by every compute call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFilter {
    pub shape: Vec<usize>,
    pub is_signed: bool,
    pub layout: FilterLayout,
}

impl PreparedFilter {
    pub fn is_packed(&self) -> bool {
        matches!(self.layout, FilterLayout::Packed { .. })
    }
}

/// Where a compute call gets its filter from.
#[derive(Debug, Clone, Copy)]
pub enum FilterSource<'f, 'a> {
    Prepared(&'f PreparedFilter),
    Tensor(&'f WeightTensor<'a>),
}

impl<'f, 'a> FilterSource<'f, 'a> {
    pub fn shape(&self) -> &[usize] {
        match self {
            FilterSource::Prepared(p) => &p.shape,
            FilterSource::Tensor(w) => w.shape(),
        }
    }

    pub fn is_signed(&self) -> bool {
        match self {
            FilterSource::Prepared(p) => p.is_signed,
            FilterSource::Tensor(w) => w.is_signed(),
        }
    }

    /// Borrow the prepared layout, or reorder the raw tensor for this call only.
    pub fn gemm_filter(&self) -> GemmFilter<'f> {
        match *self {
            FilterSource::Prepared(p) => match &p.layout {
                FilterLayout::Reordered(buf) => GemmFilter::Reordered(Cow::Borrowed(buf)),
                FilterLayout::Packed {
                    buffer,
                    group_stride,
                } => GemmFilter::Packed {
                    buffer: &buffer[..],
                    group_stride: *group_stride,
                },
            },
            FilterSource::Tensor(w) => {
                let shape = w.shape();
                let mut reordered = vec![0u8; w.len()];
                reorder_filter(
                    &w.to_bytes(),
                    &mut reordered,
                    shape[0],
                    shape[1],
                    shape_size(&shape[2..]),
                );
                GemmFilter::Reordered(Cow::Owned(reordered))
            }
        }
    }
}

/// The filter as seen by one compute call.
#[derive(Debug, Clone)]
pub enum GemmFilter<'f> {
    Reordered(Cow<'f, [u8]>),
    Packed { buffer: &'f [u8], group_stride: usize },
}

/// One-time preparation of a constant filter.
///
/// Returns `None` (leave the filter to be reordered per call) when the filter
/// rank is at most 2 or the output channels do not divide into `group`.
/// Groups with one input and one output channel are only reordered: the
/// depthwise kernel consumes that layout directly.
pub fn prepare_filter(
    weight: &WeightTensor<'_>,
    group: i64,
    backend: &dyn QuantBackend,
) -> Option<PreparedFilter> {
    let shape = weight.shape();
    let rank = shape.len();
    if rank <= 2 {
        debug!(rank, "filter prepack declined: rank <= 2");
        return None;
    }
    if group < 1 || shape[0] % group as usize != 0 {
        debug!(output_channels = shape[0], group, "filter prepack declined: group mismatch");
        return None;
    }

    let output_channels = shape[0];
    let group_input_channels = shape[1];
    let kernel_size = shape_size(&shape[2..]);
    let group_count = group as usize;
    let group_output_channels = output_channels / group_count;
    let kernel_dim = group_input_channels * kernel_size;
    let is_signed = weight.is_signed();
    let bytes = weight.to_bytes();

    let depthwise = group_input_channels == 1 && group_output_channels == 1;
    if !depthwise {
        let group_stride = backend.gemm_pack_b_size(group_output_channels, kernel_dim, is_signed);
        if group_stride != 0 {
            let mut buffer = vec![0u8; group_count * group_stride];
            let mut group_reordered = vec![0u8; group_output_channels * kernel_dim];
            let w_offset = group_output_channels * kernel_dim;
            for (g, packed) in buffer.chunks_exact_mut(group_stride).enumerate() {
                reorder_filter(
                    &bytes[g * w_offset..(g + 1) * w_offset],
                    &mut group_reordered,
                    group_output_channels,
                    group_input_channels,
                    kernel_size,
                );
                backend.gemm_pack_b(
                    group_output_channels,
                    kernel_dim,
                    &group_reordered,
                    group_output_channels,
                    is_signed,
                    packed,
                );
            }
            debug!(group_count, group_stride, "filter packed");
            return Some(PreparedFilter {
                shape: shape.to_vec(),
                is_signed,
                layout: FilterLayout::Packed {
                    buffer,
                    group_stride,
                },
            });
        }
        debug!("backend cannot pack this filter, keeping reordered layout");
    }

    let mut reordered = vec![0u8; weight.len()];
    reorder_filter(
        &bytes,
        &mut reordered,
        output_channels,
        group_input_channels,
        kernel_size,
    );
    debug!(depthwise, "filter reordered");
    Some(PreparedFilter {
        shape: shape.to_vec(),
        is_signed,
        layout: FilterLayout::Reordered(reordered),
    })
}
