use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::sync::Arc;

use dist_vector::algs::communicator::{CommTag, NoComm};
use dist_vector::layout::IndexLayout;
use dist_vector::redistribute::{CombineMode, MissingPolicy, RedistributionPlan};
use dist_vector::vector::DistVector;

/// Full ownership of `0..n` expressed as many small ranges, so offset lookups
/// and plan construction pay the multi-range cost.
fn fragmented_layout(n: u64) -> IndexLayout {
    let ranges: Vec<(u64, u64)> = (0..n).step_by(8).map(|s| (s, (s + 8).min(n))).collect();
    IndexLayout::from_ranges(ranges, n, 0).unwrap()
}

fn bench_plan_build(c: &mut Criterion) {
    let comm = NoComm;
    let tag = CommTag::new(0x0600);
    let mut group = c.benchmark_group("plan_build");
    for &n in &[1_000u64, 10_000, 100_000] {
        let src = IndexLayout::contiguous(0, n, n, 0).unwrap();
        let dst = fragmented_layout(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                RedistributionPlan::build(&dst, &src, &comm, tag, MissingPolicy::Error).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_plan_apply(c: &mut Criterion) {
    let comm = NoComm;
    let tag = CommTag::new(0x0610);
    let mut group = c.benchmark_group("plan_apply");
    for &n in &[1_000u64, 10_000, 100_000] {
        let src = IndexLayout::contiguous(0, n, n, 0).unwrap();
        let dst = fragmented_layout(n);
        let plan =
            RedistributionPlan::build(&dst, &src, &comm, tag, MissingPolicy::Error).unwrap();
        let src_vals: Vec<f64> = (0..n).map(|g| g as f64).collect();
        let mut dst_vals = vec![0.0f64; dst.local_len()];
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                plan.apply(&src_vals, &mut dst_vals, &comm, tag, CombineMode::Insert)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_local_axpy(c: &mut Criterion) {
    let mut group = c.benchmark_group("axpy");
    for &n in &[10_000u64, 1_000_000] {
        let layout = Arc::new(IndexLayout::contiguous(0, n, n, 0).unwrap());
        let mut x = DistVector::<f64, NoComm>::new(layout.clone(), Arc::new(NoComm));
        let mut y = DistVector::<f64, NoComm>::new(layout, Arc::new(NoComm));
        x.fill(1.0).unwrap();
        y.fill(2.0).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| x.axpy(0.5, &y).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_plan_build, bench_plan_apply, bench_local_axpy);
criterion_main!(benches);
