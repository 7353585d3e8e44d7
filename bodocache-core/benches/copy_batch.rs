use std::sync::Arc;
use std::time::Duration;

use bodocache_core::{CopyEngine, CopyOperation, CopySource, DevicePtr, EngineConfig, HostBackend};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

const PAGE_BYTES: usize = 64 << 10;

/// Submit-to-last-callback latency of one batch on the host backend.
fn bench_copy_batch(c: &mut Criterion) {
    let engine = CopyEngine::new(
        HostBackend::new(1),
        EngineConfig::default().with_poll_interval(Duration::from_micros(50)),
    )
    .expect("engine");

    let mut group = c.benchmark_group("copy_batch");
    for pages in [1usize, 16, 128] {
        let mut source = engine
            .acquire_host_buffer(pages * PAGE_BYTES)
            .expect("pinned buffer");
        source.as_mut_slice().fill(0xAB);
        let source = Arc::new(source);
        let mut device = vec![0u8; pages * PAGE_BYTES];
        let base = device.as_mut_ptr();

        group.throughput(Throughput::Bytes((pages * PAGE_BYTES) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &pages, |b, &pages| {
            b.iter(|| {
                let ops = (0..pages)
                    .map(|i| {
                        let offset = i * PAGE_BYTES;
                        CopyOperation::new(
                            CopySource::pinned_at(Arc::clone(&source), offset),
                            DevicePtr::from(base.wrapping_add(offset)),
                            PAGE_BYTES,
                        )
                        .with_stream(i as i32)
                    })
                    .collect();
                // SAFETY: `device` outlives this benchmark and each batch drains
                // before the next one starts.
                unsafe { engine.submit(ops, |_| {}) }.expect("submit");
                assert!(engine.wait_idle(Duration::from_secs(5)));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_copy_batch);
criterion_main!(benches);
