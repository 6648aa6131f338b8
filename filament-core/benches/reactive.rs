//! Benchmarks for the reactive engine.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use filament_core::reactive::{Cell, Computed};

fn bench_cell_get_untracked(c: &mut Criterion) {
    let cell = Cell::new(42i64);
    c.bench_function("cell_get_untracked", |b| b.iter(|| black_box(cell.get())));
}

fn bench_cell_set(c: &mut Criterion) {
    let cell = Cell::new(0i64);
    c.bench_function("cell_set", |b| b.iter(|| cell.set(black_box(42))));
}

fn bench_computed_cached_get(c: &mut Criterion) {
    let cell = Cell::new(21i64);
    let cell_c = cell.clone();
    let derived = Computed::new(move || cell_c.get() * 2);
    derived.get(); // prime the cache

    c.bench_function("computed_cached_get", |b| b.iter(|| black_box(derived.get())));
}

fn bench_write_then_recompute(c: &mut Criterion) {
    let cell = Cell::new(0i64);
    let cell_c = cell.clone();
    let derived = Computed::new(move || cell_c.get() + 1);

    c.bench_function("write_then_recompute", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i += 1;
            cell.set(i);
            black_box(derived.get())
        })
    });
}

fn bench_diamond_recompute(c: &mut Criterion) {
    let root = Cell::new(0i64);
    let (r1, r2) = (root.clone(), root.clone());
    let left = Computed::new(move || r1.get() + 1);
    let right = Computed::new(move || r2.get() + 2);
    let (l, r) = (left.clone(), right.clone());
    let join = Computed::new(move || l.get() + r.get());

    c.bench_function("diamond_recompute", |b| {
        let mut i = 0i64;
        b.iter(|| {
            i += 1;
            root.set(i);
            black_box(join.get())
        })
    });
}

criterion_group!(
    benches,
    bench_cell_get_untracked,
    bench_cell_set,
    bench_computed_cached_get,
    bench_write_then_recompute,
    bench_diamond_recompute,
);
criterion_main!(benches);
