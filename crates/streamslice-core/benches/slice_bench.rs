//! Slice store and watermark benchmarks
//!
//! Run with: cargo bench --bench slice_bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamslice_core::buffer::{BufferPool, BufferPoolConfig, BufferProvider};
use streamslice_core::slice::{SliceAssigner, SliceStore, SliceStoreConfig, WindowType};
use streamslice_core::time::{SequenceData, Watermark, WatermarkConfig, WatermarkProcessor};

fn provider() -> Arc<dyn BufferProvider> {
    Arc::new(
        BufferPool::new(
            BufferPoolConfig::builder()
                .buffer_size(4096)
                .num_buffers(4096)
                .build(),
        )
        .unwrap(),
    )
}

/// Slice boundaries for a timestamp.
fn bench_slice_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_assign");
    group.throughput(Throughput::Elements(1));

    let windows = [
        ("tumbling", WindowType::Tumbling { size: 1000 }),
        ("sliding", WindowType::Sliding { size: 1000, slide: 300 }),
    ];
    for (name, window) in windows {
        let assigner = SliceAssigner::new(window).unwrap();
        group.bench_with_input(BenchmarkId::new("bounds", name), &assigner, |b, assigner| {
            let mut ts = 0i64;
            b.iter(|| {
                ts += 7;
                black_box(assigner.slice_bounds(black_box(ts)))
            })
        });
    }
    group.finish();
}

/// Append records into a single slice.
fn bench_slice_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_append");
    group.throughput(Throughput::Elements(1024));

    group.bench_function("1024_records", |b| {
        b.iter_batched(
            || {
                SliceStore::new(
                    SliceStoreConfig {
                        window: WindowType::Tumbling { size: 1_000_000 },
                        num_workers: 1,
                        num_sides: 1,
                        record_size: 16,
                    },
                    provider(),
                )
                .unwrap()
            },
            |store| {
                let slice = store.get_or_create_slice(0).unwrap();
                let record = [0u8; 16];
                for _ in 0..1024 {
                    slice.append(0, 0, black_box(&record)).unwrap();
                }
                black_box(slice.record_count(0).unwrap())
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

/// In-order watermark updates through the log.
fn bench_watermark_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("watermark_update");
    group.throughput(Throughput::Elements(1));

    let processor = WatermarkProcessor::new(WatermarkConfig::default());
    let mut sequence = 0u64;
    group.bench_function("in_order", |b| {
        b.iter(|| {
            #[allow(clippy::cast_possible_wrap)]
            let ts = sequence as i64;
            let wm = processor
                .update(Watermark::new(ts), SequenceData::new(sequence))
                .unwrap();
            sequence += 1;
            black_box(wm)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_slice_assign,
    bench_slice_append,
    bench_watermark_update
);
criterion_main!(benches);
