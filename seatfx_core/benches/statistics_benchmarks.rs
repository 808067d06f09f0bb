//! Benchmarks for the representation penalties and pairwise scoring
//!
//! Run with: cargo bench --bench statistics_benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seatfx_core::scoring::pair_effects;
use seatfx_core::stats::{balanced_mmd_with_grad, hsic_with_grad, mmd_rbf, CrossTerm, MmdSettings};

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0))
}

fn one_hot(rows: usize, classes: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, classes), |(i, j)| if i % classes == j { 1.0 } else { 0.0 })
}

/// HSIC with gradient at growing batch sizes
fn bench_hsic(c: &mut Criterion) {
    let mut group = c.benchmark_group("hsic_with_grad");
    let mut rng = StdRng::seed_from_u64(1);

    for size in [16, 64, 256].iter() {
        let rep = random_matrix(&mut rng, *size, 160);
        let treatment = one_hot(*size, 4);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(hsic_with_grad(rep.view(), treatment.view(), 1.0)));
        });
    }

    group.finish();
}

/// RBF MMD value versus the full balanced path with gradients
fn bench_mmd(c: &mut Criterion) {
    let mut group = c.benchmark_group("mmd");
    let mut rng = StdRng::seed_from_u64(2);

    for size in [32, 128].iter() {
        let treated = random_matrix(&mut rng, *size, 160);
        let control = random_matrix(&mut rng, *size, 160);
        group.bench_with_input(BenchmarkId::new("rbf_value", size), size, |b, _| {
            b.iter(|| {
                black_box(mmd_rbf(
                    treated.view(),
                    control.view(),
                    0.5,
                    0.1,
                    CrossTerm::Literal,
                ))
            });
        });

        let rep = random_matrix(&mut rng, *size, 160);
        let treatment = one_hot(*size, 4);
        let settings = MmdSettings::default();
        let mut split_rng = StdRng::seed_from_u64(3);
        group.bench_with_input(BenchmarkId::new("balanced_grad", size), size, |b, _| {
            b.iter(|| {
                black_box(balanced_mmd_with_grad(
                    rep.view(),
                    treatment.view(),
                    &settings,
                    &mut split_rng,
                ))
            });
        });
    }

    group.finish();
}

fn bench_pair_effects(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(4);
    let prediction = random_matrix(&mut rng, 16, 100);
    let reference = random_matrix(&mut rng, 16, 100);

    c.bench_function("pair_effects_16_treatments", |b| {
        b.iter(|| black_box(pair_effects(&prediction, &reference)));
    });
}

criterion_group!(benches, bench_hsic, bench_mmd, bench_pair_effects);
criterion_main!(benches);
