//! Sorted aggregator and edge queue benchmarks
//!
//! Run with: cargo bench --bench sort_bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use riptide_core::execution::SpscQueue;
use riptide_core::memory::{BlockPool, MemoryContext};
use riptide_core::sort::SortedAggregator;
use riptide_core::storage::{IntSumAccumulator, StorageConfig, StringComparator};

fn context() -> MemoryContext {
    MemoryContext::new(
        Arc::new(BlockPool::new(128 * 1024, 2048)),
        Arc::new(BlockPool::new(128 * 1024, 2048)),
    )
}

/// Insert + sort + full cursor over n reversed string keys
fn bench_sort_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_pipeline");
    group.sample_size(10);

    for size in [10_000u32, 100_000] {
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::new("reversed_keys", size), &size, |b, &n| {
            b.iter(|| {
                let ctx = context();
                let mut agg = SortedAggregator::new(
                    &ctx,
                    &StorageConfig::default(),
                    Arc::new(StringComparator),
                    None,
                );
                for i in (1..=n).rev() {
                    let k = i.to_string();
                    assert!(agg.accept(k.as_bytes(), k.as_bytes()).unwrap());
                }
                agg.prepare_to_sort();
                while !agg.sort() {}
                let mut cursor = agg.cursor().unwrap();
                let mut count = 0u32;
                while cursor.advance().unwrap() {
                    black_box(cursor.key());
                    count += 1;
                }
                assert_eq!(count, n);
            });
        });
    }

    group.finish();
}

/// Grouped accumulation: many values collapsing onto few keys
fn bench_accumulating_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulating_insert");
    group.sample_size(10);

    let config = StorageConfig::default();
    let acc = IntSumAccumulator::new(config.use_big_endian);

    group.throughput(Throughput::Elements(100_000));
    group.bench_function("sum_10_per_key", |b| {
        b.iter(|| {
            let ctx = context();
            let mut agg = SortedAggregator::new(
                &ctx,
                &config,
                Arc::new(StringComparator),
                Some(Arc::new(acc)),
            );
            for i in 0..10_000u32 {
                let k = i.to_string();
                for _ in 0..10 {
                    assert!(agg.accept(k.as_bytes(), &acc.encode(1)).unwrap());
                }
            }
            black_box(agg.resident_record_count())
        });
    });

    group.finish();
}

/// Raw edge queue transfer rate
fn bench_spsc_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_queue");

    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        let queue: SpscQueue<u64> = SpscQueue::new(1024);
        b.iter(|| {
            queue.push(black_box(42)).unwrap();
            black_box(queue.pop())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sort_pipeline,
    bench_accumulating_insert,
    bench_spsc_queue
);
criterion_main!(benches);
