//! Kernel-level benchmarks for the quantized convolution
//!
//! Run with: cargo bench --bench kernels

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qconv::backend::{GemmB, GemmU8X8Params, QuantBackend};
use qconv::kernels::{ConvAttributes, FilterSource, QLinearConv, QLinearConvInputs};
use qconv::{CpuBackend, TensorView, WeightTensor};
use rayon::ThreadPoolBuilder;

fn pattern(len: usize, mul: usize) -> Vec<u8> {
    (0..len).map(|i| (i * mul % 251) as u8).collect()
}

// ============================================================================
// GEMM Benchmarks
// ============================================================================

fn bench_gemm(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm_u8x8");
    let backend = CpuBackend::new();

    // (M, K, N): output positions x kernel_dim x group output channels
    let sizes = [(196, 576, 64), (784, 288, 32), (3136, 27, 16), (49, 1152, 128)];

    for &(m, k, n) in &sizes {
        let a = pattern(m * k, 31);
        let b = pattern(k * n, 17);
        let mut packed = vec![0u8; backend.gemm_pack_b_size(n, k, true)];
        backend.gemm_pack_b(n, k, &b, n, true, &mut packed);
        let mut out = vec![0i32; m * n];

        group.throughput(Throughput::Elements((m * k * n) as u64));
        for (name, operand) in [
            ("packed", GemmB::Packed(&packed)),
            ("raw", GemmB::Raw { data: &b, ldb: n }),
        ] {
            let params = GemmU8X8Params {
                m,
                n,
                k,
                a: &a,
                lda: k,
                zero_point_a: 128,
                b: operand,
                zero_point_b: 0,
                b_is_signed: true,
                ldc: n,
            };
            group.bench_with_input(
                BenchmarkId::new(name, format!("{}x{}x{}", m, k, n)),
                &params,
                |bencher, params| {
                    bencher.iter(|| backend.gemm(black_box(params), &mut out));
                },
            );
        }
    }

    group.finish();
}

// ============================================================================
// QLinearConv Benchmarks
// ============================================================================

fn bench_qlinear_conv(c: &mut Criterion) {
    let mut group = c.benchmark_group("qlinear_conv");
    let pool = ThreadPoolBuilder::new().num_threads(4).build().unwrap();

    // (name, x_shape NCHW, w_shape, group, pads)
    let cases: [(&str, [usize; 4], [usize; 4], i64, [i64; 4]); 4] = [
        ("conv3x3", [1, 64, 56, 56], [64, 64, 3, 3], 1, [1, 1, 1, 1]),
        ("pointwise", [1, 128, 28, 28], [256, 128, 1, 1], 1, [0, 0, 0, 0]),
        ("depthwise", [1, 128, 56, 56], [128, 1, 3, 3], 128, [1, 1, 1, 1]),
        ("grouped", [1, 64, 28, 28], [64, 16, 3, 3], 4, [1, 1, 1, 1]),
    ];

    for (name, x_shape, w_shape, groups, pads) in cases {
        let x_len: usize = x_shape.iter().product();
        let w_len: usize = w_shape.iter().product();
        let x = TensorView::from_owned(pattern(x_len, 7), x_shape.to_vec());
        let w: WeightTensor = TensorView::from_owned(pattern(w_len, 13), w_shape.to_vec()).into();
        let scale = TensorView::scalar(0.02f32);
        let zp = TensorView::scalar(128u8);
        let w_zp: WeightTensor = TensorView::scalar(128u8).into();
        let inputs = QLinearConvInputs {
            x: &x,
            x_scale: &scale,
            x_zero_point: &zp,
            w_scale: &scale,
            w_zero_point: &w_zp,
            y_scale: Some(&scale),
            y_zero_point: Some(&zp),
            bias: None,
        };

        for channels_last in [false, true] {
            let attrs = ConvAttributes::new(groups)
                .with_pads(&pads)
                .channels_last(channels_last);
            let conv = QLinearConv::new(attrs);
            let prepared = conv.prepack(&w);
            let filter = match &prepared {
                Some(p) => FilterSource::Prepared(p),
                None => FilterSource::Tensor(&w),
            };
            let x_nhwc;
            let inputs = if channels_last {
                let [n, ch, h, wd] = x_shape;
                x_nhwc = TensorView::from_owned(x.data.to_vec(), vec![n, h, wd, ch]);
                QLinearConvInputs { x: &x_nhwc, ..inputs }
            } else {
                inputs
            };
            let layout = if channels_last { "nhwc" } else { "nchw" };
            let mut out = Vec::new();

            group.bench_function(BenchmarkId::new(name, format!("{}_seq", layout)), |bencher| {
                bencher.iter(|| {
                    let _ = conv.compute(black_box(&inputs), filter, None, &mut out);
                });
            });
            group.bench_function(BenchmarkId::new(name, format!("{}_pool4", layout)), |bencher| {
                bencher.iter(|| {
                    let _ = conv.compute(black_box(&inputs), filter, Some(&pool), &mut out);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_gemm, bench_qlinear_conv);
criterion_main!(benches);
