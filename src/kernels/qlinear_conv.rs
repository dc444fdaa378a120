use crate::backend::{CpuBackend, GemmB, GemmU8X8Params, QuantBackend};
use crate::error::{QConvError, Result};
use crate::kernels::conv_attrs::{ConvAttributes, ConvGeometry};
use crate::kernels::im2col::{build_indirection, im2col_nhwc_2d, im2col_nhwc_nd};
use crate::kernels::partition::{is_hybrid_cpu, max_thread_count, partition_work};
use crate::kernels::quant_params::{resolve_quant_params, QuantInputs, QuantParams};
use crate::kernels::utils::ensure_len;
use crate::kernels::weights::{prepare_filter, FilterSource, GemmFilter, PreparedFilter};
use crate::tensor::{TensorView, WeightTensor};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::ops::Range;
use tracing::{debug, trace};

/// Operator inputs other than the filter, which is passed as a [`FilterSource`].
#[derive(Debug, Clone, Copy)]
pub struct QLinearConvInputs<'i, 'a> {
    pub x: &'i TensorView<'a, u8>,
    pub x_scale: &'i TensorView<'a, f32>,
    pub x_zero_point: &'i TensorView<'a, u8>,
    pub w_scale: &'i TensorView<'a, f32>,
    pub w_zero_point: &'i WeightTensor<'a>,
    pub y_scale: Option<&'i TensorView<'a, f32>>,
    pub y_zero_point: Option<&'i TensorView<'a, u8>>,
    pub bias: Option<&'i TensorView<'a, i32>>,
}

/// How one call turns input images into int32 accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One input and one output channel per group: indirection buffer plus
    /// the backend depthwise kernel.
    Depthwise,
    /// 1x..x1 kernel, unit strides, no padding: GEMM straight off the
    /// channel-last input.
    Pointwise { packed: bool },
    /// im2col into a column buffer, then GEMM.
    Im2col { packed: bool },
}

impl ExecutionStrategy {
    fn select(geometry: &ConvGeometry, filter: &GemmFilter<'_>) -> Self {
        let packed = matches!(filter, GemmFilter::Packed { .. });
        if !packed && geometry.group_input_channels() == 1 && geometry.group_output_channels() == 1 {
            ExecutionStrategy::Depthwise
        } else if geometry.is_pointwise() {
            ExecutionStrategy::Pointwise { packed }
        } else {
            ExecutionStrategy::Im2col { packed }
        }
    }
}

/// Quantized grouped convolution over u8 activations and u8/i8 filters.
///
/// ```ignore
/// let conv = QLinearConv::new(ConvAttributes::new(1).with_pads(&[1, 1, 1, 1]));
/// let prepared = conv.prepack(&w);
/// let filter = match &prepared {
///     Some(p) => FilterSource::Prepared(p),
///     None => FilterSource::Tensor(&w),
/// };
/// let y = conv.compute(&inputs, filter, Some(&pool), &mut out)?;
/// ```
#[derive(Debug, Clone)]
pub struct QLinearConv<B: QuantBackend = CpuBackend> {
    attrs: ConvAttributes,
    hybrid: bool,
    backend: B,
}

impl QLinearConv<CpuBackend> {
    pub fn new(attrs: ConvAttributes) -> Self {
        Self::with_backend(attrs, CpuBackend::new())
    }
}

impl<B: QuantBackend> QLinearConv<B> {
    pub fn with_backend(attrs: ConvAttributes, backend: B) -> Self {
        Self {
            attrs,
            hybrid: is_hybrid_cpu(),
            backend,
        }
    }

    /// Override the detected CPU topology used to size tiles.
    pub fn with_hybrid(mut self, hybrid: bool) -> Self {
        self.hybrid = hybrid;
        self
    }

    pub fn attributes(&self) -> &ConvAttributes {
        &self.attrs
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// One-time preparation of a constant filter. `None` means the filter is
    /// reordered on every call instead.
    pub fn prepack(&self, weight: &WeightTensor<'_>) -> Option<PreparedFilter> {
        prepare_filter(weight, self.attrs.group, &self.backend)
    }

    /// Runs the convolution, writing Y into `out`.
    ///
    /// All validation happens before `out` is touched. Images are processed in
    /// order; within an image, tiles of output positions run on `pool` (or on
    /// the calling thread when `pool` is `None`).
    pub fn compute<'o>(
        &self,
        inputs: &QLinearConvInputs<'_, '_>,
        filter: FilterSource<'_, '_>,
        pool: Option<&ThreadPool>,
        out: &'o mut Vec<u8>,
    ) -> Result<TensorView<'o, u8>> {
        let x = inputs.x;
        let geometry = ConvGeometry::resolve(&self.attrs, &x.shape, filter.shape())?;
        let w_is_signed = filter.is_signed();
        let quant = resolve_quant_params(
            &QuantInputs {
                x_scale: inputs.x_scale,
                x_zero_point: inputs.x_zero_point,
                w_scale: inputs.w_scale,
                w_zero_point: inputs.w_zero_point,
                y_scale: inputs.y_scale,
                y_zero_point: inputs.y_zero_point,
            },
            geometry.output_channels,
            w_is_signed,
        )?;
        let bias = match inputs.bias {
            Some(b) if b.len() != geometry.output_channels => {
                return Err(QConvError::InvalidArgument(format!(
                    "QLinearConv : bias has {} elements, expected {}",
                    b.len(),
                    geometry.output_channels
                )));
            }
            Some(b) => Some(&b.data[..]),
            None => None,
        };

        if geometry.is_empty_output() {
            debug!(y_shape = ?geometry.y_shape, "empty output, nothing to compute");
            out.clear();
            return Ok(TensorView::from_slice(&out[..], geometry.y_shape));
        }

        let gemm_filter = filter.gemm_filter();
        let strategy = ExecutionStrategy::select(&geometry, &gemm_filter);
        let (group_count, group_input_channels, group_output_channels) = match strategy {
            // Every channel is its own group; run them all in one pass.
            ExecutionStrategy::Depthwise => (1, geometry.group, geometry.group),
            _ => (
                geometry.group,
                geometry.group_input_channels(),
                geometry.group_output_channels(),
            ),
        };
        if let GemmFilter::Packed {
            buffer,
            group_stride,
        } = &gemm_filter
        {
            if buffer.len() != group_count * group_stride {
                return Err(QConvError::InvalidArgument(format!(
                    "QLinearConv : prepared filter holds {} bytes, expected {} groups of {}",
                    buffer.len(),
                    group_count,
                    group_stride
                )));
            }
        }

        let channels = geometry.input_channels;
        let output_channels = geometry.output_channels;
        let input_image_size = geometry.input_image_size;
        let output_image_size = geometry.output_image_size;
        let kernel_dim = group_input_channels * geometry.kernel_size;
        let channels_last = geometry.channels_last;

        let pool_threads = pool.map_or(1, |p| p.current_num_threads());
        let thread_count = max_thread_count(
            output_image_size,
            group_output_channels,
            kernel_dim,
            self.hybrid,
            Some(pool_threads),
        );
        let ranges: Vec<Range<usize>> = (0..thread_count)
            .map(|i| partition_work(i, thread_count, output_image_size))
            .collect();
        debug!(
            ?strategy,
            thread_count,
            batch = geometry.batch,
            group_count,
            kernel_dim,
            "qlinear conv"
        );

        let im2col = matches!(strategy, ExecutionStrategy::Im2col { .. });
        let whole_image_col = im2col && geometry.kernel_rank >= 3;
        let col_buffer_size = kernel_dim * output_image_size;
        let mut col_buffer = match (im2col, whole_image_col) {
            (true, true) => vec![0u8; group_count * col_buffer_size],
            (true, false) => vec![0u8; col_buffer_size],
            _ => Vec::new(),
        };
        let mut transposed_input = if channels_last {
            Vec::new()
        } else {
            vec![0u8; channels * input_image_size]
        };
        let mut output_nhwc = if channels_last {
            Vec::new()
        } else {
            vec![0u8; output_image_size * output_channels]
        };
        let mut acc = vec![0i32; output_image_size * output_channels];
        let padding_row = match strategy {
            ExecutionStrategy::Depthwise => vec![quant.x_zero_point; channels],
            _ => Vec::new(),
        };

        let x_image_len = channels * input_image_size;
        let y_image_len = output_channels * output_image_size;
        ensure_len(out, geometry.batch * y_image_len);

        for n in 0..geometry.batch {
            let x_image = &x.data[n * x_image_len..(n + 1) * x_image_len];
            let input: &[u8] = if channels_last {
                x_image
            } else {
                self.backend
                    .transpose(x_image, &mut transposed_input, channels, input_image_size);
                &transposed_input[..]
            };

            let (whole_col, tile_col): (&[u8], &mut [u8]) = if whole_image_col {
                if col_buffer_size > 0 {
                    for (g, col) in col_buffer.chunks_exact_mut(col_buffer_size).enumerate() {
                        im2col_nhwc_nd(
                            &input[g * group_input_channels..],
                            group_input_channels,
                            channels,
                            &geometry.input_shape,
                            &geometry.output_shape,
                            &geometry.kernel_shape,
                            &geometry.strides,
                            &geometry.dilations,
                            &geometry.pads,
                            col,
                            quant.x_zero_point,
                        );
                    }
                }
                (&col_buffer[..], Default::default())
            } else {
                (Default::default(), &mut col_buffer[..])
            };

            let y_image: &mut [u8] = if channels_last {
                &mut out[n * y_image_len..(n + 1) * y_image_len]
            } else {
                &mut output_nhwc[..]
            };
            let col_row_len = if tile_col.is_empty() { 0 } else { kernel_dim };
            let tiles = split_tiles(&ranges, &mut acc, y_image, tile_col, output_channels, col_row_len);

            let ctx = TileContext {
                geometry: &geometry,
                quant: &quant,
                strategy,
                filter: &gemm_filter,
                w_is_signed,
                input,
                whole_col,
                padding_row: &padding_row,
                bias,
                group_count,
                group_input_channels,
                group_output_channels,
                kernel_dim,
                col_buffer_size,
            };
            let run = |tile: Tile<'_>| self.run_tile(&ctx, tile);
            match pool {
                Some(pool) if tiles.len() > 1 => pool.install(|| tiles.into_par_iter().for_each(&run)),
                _ => tiles.into_iter().for_each(&run),
            }

            if !channels_last {
                self.backend.transpose(
                    &output_nhwc,
                    &mut out[n * y_image_len..(n + 1) * y_image_len],
                    output_image_size,
                    output_channels,
                );
            }
        }

        Ok(TensorView::from_slice(&out[..], geometry.y_shape))
    }

    fn run_tile(&self, ctx: &TileContext<'_>, tile: Tile<'_>) {
        let Tile {
            start,
            count,
            acc,
            out,
            col,
        } = tile;
        if count == 0 {
            return;
        }
        let geometry = ctx.geometry;
        let channels = geometry.input_channels;
        trace!(start, count, "tile");

        match ctx.strategy {
            ExecutionStrategy::Depthwise => {
                if let GemmFilter::Reordered(filter) = ctx.filter {
                    let mut indirection = Vec::new();
                    build_indirection(
                        ctx.input,
                        ctx.padding_row,
                        channels,
                        &geometry.input_shape,
                        &geometry.output_shape,
                        &geometry.kernel_shape,
                        &geometry.strides,
                        &geometry.dilations,
                        &geometry.pads,
                        start,
                        count,
                        &mut indirection,
                    );
                    self.backend.conv_depthwise(
                        &indirection,
                        ctx.quant.x_zero_point,
                        filter,
                        ctx.quant.w_zero_point,
                        ctx.w_is_signed,
                        acc,
                        channels,
                        count,
                        geometry.kernel_size,
                    );
                }
            }
            ExecutionStrategy::Pointwise { .. } => {
                for group in 0..ctx.group_count {
                    let a = &ctx.input[start * channels + group * ctx.group_input_channels..];
                    self.gemm_group(ctx, group, a, channels, count, acc);
                }
            }
            ExecutionStrategy::Im2col { .. } if geometry.kernel_rank >= 3 => {
                for group in 0..ctx.group_count {
                    let offset = group * ctx.col_buffer_size + start * ctx.kernel_dim;
                    let a = &ctx.whole_col[offset..];
                    self.gemm_group(ctx, group, a, ctx.kernel_dim, count, acc);
                }
            }
            ExecutionStrategy::Im2col { .. } => {
                for group in 0..ctx.group_count {
                    im2col_tile(ctx, group, start, count, col);
                    self.gemm_group(ctx, group, col, ctx.kernel_dim, count, acc);
                }
            }
        }

        self.backend.requantize_output(
            acc,
            out,
            ctx.bias,
            count,
            geometry.output_channels,
            &ctx.quant.output_scales,
            ctx.quant.per_channel(),
            ctx.quant.y_zero_point,
        );
    }

    /// `acc[:, group]` = tile rows of `a` times the group's filter columns.
    fn gemm_group(
        &self,
        ctx: &TileContext<'_>,
        group: usize,
        a: &[u8],
        lda: usize,
        count: usize,
        acc: &mut [i32],
    ) {
        let gn = ctx.group_output_channels;
        let ldc = ctx.geometry.output_channels;
        let b = match ctx.filter {
            GemmFilter::Packed {
                buffer,
                group_stride,
            } => GemmB::Packed(&buffer[group * group_stride..(group + 1) * group_stride]),
            GemmFilter::Reordered(data) => GemmB::Raw {
                data: &data[group * gn..],
                ldb: ldc,
            },
        };
        let params = GemmU8X8Params {
            m: count,
            n: gn,
            k: ctx.kernel_dim,
            a,
            lda,
            zero_point_a: ctx.quant.x_zero_point,
            b,
            zero_point_b: ctx.quant.w_zero_point,
            b_is_signed: ctx.w_is_signed,
            ldc,
        };
        self.backend.gemm(&params, &mut acc[group * gn..]);
    }
}

/// Read-only state shared by every tile of one image.
struct TileContext<'c> {
    geometry: &'c ConvGeometry,
    quant: &'c QuantParams,
    strategy: ExecutionStrategy,
    filter: &'c GemmFilter<'c>,
    w_is_signed: bool,
    /// Channel-last input image.
    input: &'c [u8],
    /// Per-group column buffers for kernels of rank 3 and up.
    whole_col: &'c [u8],
    padding_row: &'c [u8],
    bias: Option<&'c [i32]>,
    group_count: usize,
    group_input_channels: usize,
    group_output_channels: usize,
    kernel_dim: usize,
    col_buffer_size: usize,
}

/// A contiguous run of output positions and the buffer slices only it writes.
struct Tile<'t> {
    start: usize,
    count: usize,
    acc: &'t mut [i32],
    out: &'t mut [u8],
    col: &'t mut [u8],
}

fn split_tiles<'t>(
    ranges: &[Range<usize>],
    mut acc: &'t mut [i32],
    mut out: &'t mut [u8],
    mut col: &'t mut [u8],
    row_len: usize,
    col_row_len: usize,
) -> Vec<Tile<'t>> {
    let mut tiles = Vec::with_capacity(ranges.len());
    for range in ranges {
        let count = range.len();
        let (tile_acc, rest) = std::mem::take(&mut acc).split_at_mut(count * row_len);
        acc = rest;
        let (tile_out, rest) = std::mem::take(&mut out).split_at_mut(count * row_len);
        out = rest;
        let (tile_col, rest) = std::mem::take(&mut col).split_at_mut(count * col_row_len);
        col = rest;
        tiles.push(Tile {
            start: range.start,
            count,
            acc: tile_acc,
            out: tile_out,
            col: tile_col,
        });
    }
    tiles
}

/// im2col of one group over one tile, for kernels of rank 1 and 2.
fn im2col_tile(ctx: &TileContext<'_>, group: usize, start: usize, count: usize, col: &mut [u8]) {
    let g = ctx.geometry;
    let gic = ctx.group_input_channels;
    let input = &ctx.input[group * gic..];
    let zp = ctx.quant.x_zero_point;
    if g.kernel_rank == 1 {
        im2col_nhwc_2d(
            input,
            gic,
            g.input_channels,
            1,
            g.input_shape[0],
            1,
            g.kernel_shape[0],
            1,
            g.dilations[0],
            0,
            g.pads[0],
            1,
            g.strides[0],
            g.output_shape[0],
            start,
            count,
            col,
            zp,
        );
    } else {
        im2col_nhwc_2d(
            input,
            gic,
            g.input_channels,
            g.input_shape[0],
            g.input_shape[1],
            g.kernel_shape[0],
            g.kernel_shape[1],
            g.dilations[0],
            g.dilations[1],
            g.pads[0],
            g.pads[1],
            g.strides[0],
            g.strides[1],
            g.output_shape[1],
            start,
            count,
            col,
            zp,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(group: i64, x: &[usize], w: &[usize], pads: &[i64]) -> ConvGeometry {
        let attrs = ConvAttributes::new(group).with_pads(pads);
        ConvGeometry::resolve(&attrs, x, w).unwrap()
    }

    #[test]
    fn test_strategy_selection() {
        let reordered = GemmFilter::Reordered(std::borrow::Cow::Owned(Vec::new()));
        let packed = GemmFilter::Packed {
            buffer: &[],
            group_stride: 0,
        };

        let dw = geometry(4, &[1, 4, 5, 5], &[4, 1, 3, 3], &[1, 1, 1, 1]);
        assert_eq!(ExecutionStrategy::select(&dw, &reordered), ExecutionStrategy::Depthwise);

        let pw = geometry(2, &[1, 4, 5, 5], &[6, 2, 1, 1], &[]);
        assert_eq!(
            ExecutionStrategy::select(&pw, &packed),
            ExecutionStrategy::Pointwise { packed: true }
        );
        assert_eq!(
            ExecutionStrategy::select(&pw, &reordered),
            ExecutionStrategy::Pointwise { packed: false }
        );

        let generic = geometry(1, &[1, 3, 5, 5], &[8, 3, 3, 3], &[1, 1, 1, 1]);
        assert_eq!(
            ExecutionStrategy::select(&generic, &packed),
            ExecutionStrategy::Im2col { packed: true }
        );
    }

    #[test]
    fn test_split_tiles_is_disjoint_and_complete() {
        let ranges: Vec<_> = (0..3).map(|i| partition_work(i, 3, 7)).collect();
        let mut acc = vec![0i32; 7 * 2];
        let mut out = vec![0u8; 7 * 2];
        let mut col = vec![0u8; 7 * 5];
        let tiles = split_tiles(&ranges, &mut acc, &mut out, &mut col, 2, 5);
        let counts: Vec<_> = tiles.iter().map(|t| (t.start, t.count, t.acc.len(), t.col.len())).collect();
        assert_eq!(counts, vec![(0, 3, 6, 15), (3, 2, 4, 10), (5, 2, 4, 10)]);
    }

    #[test]
    fn test_failed_call_leaves_output_untouched() {
        let conv = QLinearConv::new(ConvAttributes::default());
        let x = TensorView::from_owned(vec![1u8; 4], vec![1, 1, 2, 2]);
        let w: WeightTensor = TensorView::from_owned(vec![1u8; 2], vec![2, 1, 1, 1]).into();
        let one = TensorView::scalar(1.0f32);
        let zp = TensorView::scalar(0u8);
        let w_zp: WeightTensor = TensorView::scalar(0u8).into();
        let bias = TensorView::from_owned(vec![0i32; 3], vec![3]);
        let inputs = QLinearConvInputs {
            x: &x,
            x_scale: &one,
            x_zero_point: &zp,
            w_scale: &one,
            w_zero_point: &w_zp,
            y_scale: Some(&one),
            y_zero_point: Some(&zp),
            bias: Some(&bias),
        };
        let mut out = vec![42u8; 3];
        let err = conv
            .compute(&inputs, FilterSource::Tensor(&w), None, &mut out)
            .unwrap_err();
        assert!(matches!(err, QConvError::InvalidArgument(_)));
        assert_eq!(out, vec![42u8; 3]);
    }
}
