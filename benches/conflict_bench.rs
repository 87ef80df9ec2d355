//! Benchmarks for gradient conflict statistics and extraction.
//!
//! Run with: cargo bench

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use grad_conflict_rs::extraction::extract_loss_gradients;
use grad_conflict_rs::{LossMap, NamedParameters, ParamStore, ScopeStats};

fn bench_scope_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope_stats");
    let device = Device::Cpu;

    for (losses, len) in [(2, 10_000), (4, 10_000), (4, 500_000), (8, 100_000)].iter() {
        let vectors: Vec<(String, Tensor)> = (0..*losses)
            .map(|i| {
                let v = Tensor::randn(0.0f32, 1.0, *len, &device).unwrap();
                (format!("loss{i}"), v)
            })
            .collect();

        let label = format!("losses={losses}_len={len}");
        group.bench_with_input(BenchmarkId::new("compute", &label), &vectors, |bench, v| {
            bench.iter(|| black_box(ScopeStats::compute(v).unwrap()))
        });
    }

    group.finish();
}

fn bench_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_loss_gradients");
    let device = Device::Cpu;

    for blocks in [4, 12].iter() {
        let mut store = ParamStore::new();
        let mut vars = Vec::new();
        for b in 0..*blocks {
            let init = Tensor::randn(0.0f32, 0.02, (64, 64), &device).unwrap();
            let name = format!("visual.transformer.resblocks.{b}.mlp.c_fc.weight");
            vars.push(store.add(name, init, true).unwrap());
        }
        let x = Tensor::randn(0.0f32, 1.0, (8, 64), &device).unwrap();

        let mut losses = LossMap::new();
        for (i, scale) in [1.0, -0.5, 0.25].iter().enumerate() {
            let mut h = x.clone();
            for v in &vars {
                h = h.matmul(v.as_tensor()).unwrap().tanh().unwrap();
            }
            let loss = h.sum_all().unwrap().affine(*scale, 0.0).unwrap();
            losses.insert(format!("loss{i}"), loss);
        }
        let params = store.trainable_parameters();

        group.bench_with_input(BenchmarkId::new("blocks", blocks), &losses, |bench, l| {
            bench.iter(|| black_box(extract_loss_gradients(l, &params).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scope_stats, bench_extraction);
criterion_main!(benches);
