//! Criterion cross-check for the cpu operators, independent of the adaptive timing loop.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use microperf::prelude::*;
use microperf_cpu::{cpu_registry, CpuBackend};

const GEMM_SIZES: &[(&str, [usize; 3])] = &[
    ("128", [128, 128, 128]),
    ("512", [512, 512, 512]),
    ("1024x4096x1024", [1024, 4096, 1024]),
];

const ELEMENTWISE_SIZES: &[usize] = &[1 << 12, 1 << 16, 1 << 20];

// ============================================================================
// Helpers
// ============================================================================

fn bench_op(
    c: &mut Criterion,
    group_name: &str,
    op_name: &str,
    cases: &[(String, Vec<Vec<usize>>)],
    dtype: DType,
) {
    let backend = CpuBackend::new();
    let registry = cpu_registry(1);
    let Ok(op) = registry.get(op_name) else {
        println!("error:  Skipping {op_name} - not registered");
        return;
    };
    let mut group = c.benchmark_group(group_name);

    for (label, shapes) in cases {
        let sizes = match op.compute_size(shapes, dtype) {
            Ok(sizes) => sizes,
            Err(e) => {
                println!("error:  Skipping {op_name}/{label} - {e}");
                continue;
            }
        };
        let mut tensors = match op.create_tensors(shapes, dtype, backend.device()) {
            Ok(t) => t,
            Err(e) => {
                println!("error:  Skipping {op_name}/{label} - {e}");
                continue;
            }
        };
        group.throughput(Throughput::Bytes(sizes.rw_bytes));
        group.bench_with_input(BenchmarkId::from_parameter(label), shapes, |b, _| {
            b.iter(|| op.run(&backend, &mut tensors))
        });
    }

    group.finish();
}

// ============================================================================
// Benchmarks
// ============================================================================

fn gemm_benchmarks(c: &mut Criterion) {
    let cases: Vec<_> = GEMM_SIZES
        .iter()
        .map(|(name, [m, k, n])| (name.to_string(), vec![vec![*m, *k], vec![*k, *n]]))
        .collect();
    bench_op(c, "cpu/gemm/f32", "gemm", &cases, DType::F32);
    bench_op(c, "cpu/gemm/bf16", "gemm", &cases[..1], DType::Bf16);
}

fn elementwise_benchmarks(c: &mut Criterion) {
    let binary: Vec<_> = ELEMENTWISE_SIZES
        .iter()
        .map(|n| (n.to_string(), vec![vec![*n], vec![*n]]))
        .collect();
    let unary: Vec<_> = ELEMENTWISE_SIZES
        .iter()
        .map(|n| (n.to_string(), vec![vec![*n / 1024, 1024]]))
        .collect();
    bench_op(c, "cpu/add", "add", &binary, DType::F32);
    bench_op(c, "cpu/gelu", "gelu", &unary, DType::F32);
    bench_op(c, "cpu/softmax", "softmax", &unary, DType::F32);
    bench_op(c, "cpu/layernorm", "layernorm", &unary, DType::F16);
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(std::time::Duration::from_millis(500))
        .measurement_time(std::time::Duration::from_secs(2));
    targets = gemm_benchmarks, elementwise_benchmarks
}

criterion_main!(benches);
