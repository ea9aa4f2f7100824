//! Performance benchmarks for the Planar present pipeline
//!
//! These benchmarks cover the per-frame hot paths to prevent regressions
//! and guide optimization efforts: buffer-cache lookups and the
//! deferred-destruction handoff.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use planar::layer::{BufferKey, NativeBufferDesc, PixelFormat};
use planar::resources::{GpuResources, OverlayBuffer, ResourceManager};

fn populated_manager(entries: u64) -> ResourceManager {
    let rm = ResourceManager::new();
    for key in 0..entries {
        let buffer = Arc::new(OverlayBuffer::new(
            NativeBufferDesc::linear(BufferKey(key), 1920, 1080, PixelFormat::XRGB8888),
            key as u32 + 1,
            GpuResources::default(),
            rm.reaper(),
        ));
        rm.register_buffer(BufferKey(key), buffer);
    }
    rm
}

/// Benchmark cache lookups at typical composition sizes
fn bench_cache_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lookup");

    for entries in [4u64, 16, 64].iter() {
        group.bench_with_input(
            format!("find_with_{}_buffers", entries),
            entries,
            |b, &entries| {
                let rm = populated_manager(entries);
                b.iter(|| {
                    for key in 0..entries {
                        black_box(rm.find_cached_buffer(BufferKey(key)));
                    }
                });
                rm.purge_all();
                let _ = rm.get_purged_resources();
            },
        );
    }

    group.finish();
}

/// Benchmark the per-frame aging + purge handoff
fn bench_prepare_purged(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_purged");

    for entries in [0u64, 16, 64].iter() {
        group.bench_with_input(
            format!("prepare_with_{}_buffers", entries),
            entries,
            |b, &entries| {
                b.iter_batched(
                    || populated_manager(entries),
                    |rm| {
                        // Age the full window through; last call hands off.
                        for _ in 0..5 {
                            black_box(rm.prepare_purged_resources());
                        }
                        let _ = rm.get_purged_resources();
                        rm
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_cache_lookup, bench_prepare_purged);
criterion_main!(benches);
