//! Bump fast-path benchmarks using criterion.
//!
//! Run with: cargo bench --bench bump

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memregion::{kernel, PolicyBuilder, Region};

fn bench_bump(c: &mut Criterion) {
    c.bench_function("allocate_1000x64", |b| {
        let mut region = Region::new();
        b.iter(|| {
            for _ in 0..1000 {
                black_box(region.allocate_aligned(64));
            }
            region.reset();
        });
    });

    c.bench_function("create_1000_u64", |b| {
        let mut region = Region::new();
        b.iter(|| {
            for i in 0..1000u64 {
                black_box(region.create(i));
            }
            region.reset();
        });
    });

    c.bench_function("allocate_1000x64_paged_blocks", |b| {
        let policy = PolicyBuilder::new()
            .start_block_size(64 * 1024)
            .max_block_size(1024 * 1024)
            .block_allocator(kernel::alloc_pages, kernel::dealloc_pages)
            .build()
            .unwrap();
        let mut region = Region::with_policy(policy);
        b.iter(|| {
            for _ in 0..1000 {
                black_box(region.allocate_aligned(64));
            }
            region.reset();
        });
    });
}

criterion_group!(benches, bench_bump);
criterion_main!(benches);
