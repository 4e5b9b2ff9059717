//! Benchmarks for symbios-dcgp.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use symbios_dcgp::{AnnExpression, Expression, GridConfig, KernelSet, Loss};

fn bench_expression_creation(c: &mut Criterion) {
    let kernels = KernelSet::basic();
    let config = GridConfig::new(2, 4, 2, 100, 101, 2);

    c.bench_function("expression_random", |b| {
        let mut seed = 0u64;
        b.iter(|| {
            seed = seed.wrapping_add(1);
            black_box(Expression::random(&config, kernels.clone(), seed).unwrap());
        });
    });
}

fn bench_mutate_active(c: &mut Criterion) {
    let kernels = KernelSet::basic();
    for (rows, cols) in [(1usize, 100usize), (2, 100), (1, 1000)] {
        let config = GridConfig::new(2, 4, rows, cols, cols + 1, 2);
        let mut expr = Expression::random(&config, kernels.clone(), 42).unwrap();
        c.bench_function(&format!("mutate_active_{rows}x{cols}"), |b| {
            b.iter(|| {
                expr.mutate_active(2);
                black_box(expr.chromosome().len());
            });
        });
    }
}

fn bench_numeric_evaluation(c: &mut Criterion) {
    let kernels = KernelSet::basic();
    let config = GridConfig::new(2, 4, 2, 100, 101, 2);
    let expr = Expression::random(&config, kernels, 42).unwrap();

    c.bench_function("expression_call", |b| {
        b.iter(|| {
            black_box(expr.call(&[1.2, -0.3]).unwrap());
        });
    });
}

fn bench_backprop(c: &mut Criterion) {
    let config = GridConfig::new(1, 1, 50, 3, 1, 5);
    let kernels = KernelSet::from_names(&["tanh"]).unwrap();
    let mut ann = AnnExpression::random(&config, kernels, 42).unwrap();
    ann.randomise_weights(0.0, 0.1, 1).unwrap();
    ann.randomise_biases(0.0, 0.1, 2).unwrap();

    c.bench_function("ann_d_loss_single", |b| {
        b.iter(|| {
            black_box(ann.d_loss(&[0.22], &[0.23], Loss::Mse).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_expression_creation,
    bench_mutate_active,
    bench_numeric_evaluation,
    bench_backprop,
);
criterion_main!(benches);
