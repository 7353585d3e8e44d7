//! End-to-end lifecycle checks on the host backend: storage read into pinned
//! memory, page-sized copies to "device" memory, completion accounting.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bodocache_core::{
    CallbackPolicy, Completion, CopyEngine, CopyOperation, CopySource, DevicePtr, EngineConfig,
    HostBackend, RangeReader, ReaderConfig,
};
use parking_lot::Mutex;

const DRAIN: Duration = Duration::from_secs(10);

/// xorshift, enough to spread sizes and streams without a rand dependency.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn engine(devices: i32, policy: CallbackPolicy) -> CopyEngine<HostBackend> {
    CopyEngine::new(
        HostBackend::new(devices).with_completion_after(2),
        EngineConfig::default()
            .with_devices(0..devices)
            .with_streams_per_device(3)
            .with_poll_interval(Duration::from_micros(100))
            .with_callback_policy(policy),
    )
    .unwrap()
}

#[test]
fn mixed_batches_deliver_each_op_once_and_free_every_buffer() {
    let engine = engine(2, CallbackPolicy::PerBatch);
    let mut rng = Lcg(0x9E37_79B9_7F4A_7C15);
    let seen: Arc<Mutex<HashMap<i64, Completion>>> = Arc::default();
    let duplicates = Arc::new(AtomicUsize::new(0));
    let mut device = vec![0u8; 1 << 16];
    let mut expected_ops = 0i64;

    for _batch in 0..20 {
        let buffer = Arc::new({
            let bytes = 512 + rng.below(4096) as usize;
            let mut buffer = engine.acquire_host_buffer(bytes).unwrap();
            buffer.as_mut_slice().fill(rng.below(256) as u8);
            buffer
        });
        let ops: Vec<CopyOperation> = (0..1 + rng.below(12))
            .map(|_| {
                let offset = rng.below(buffer.len() as u64 / 2) as usize;
                let bytes = 1 + rng.below((buffer.len() - offset) as u64) as usize;
                let dst = rng.below((device.len() - bytes) as u64) as usize;
                let op = CopyOperation::new(
                    CopySource::pinned_at(Arc::clone(&buffer), offset),
                    DevicePtr::from(device[dst..].as_mut_ptr()),
                    bytes,
                )
                .with_stream(rng.next() as i32)
                .on_device(rng.below(2) as i32)
                .with_deadline(expected_ops);
                expected_ops += 1;
                op
            })
            .collect();
        drop(buffer);

        let seen = Arc::clone(&seen);
        let duplicates = Arc::clone(&duplicates);
        // SAFETY: `device` outlives the engine's writes, which land during submit.
        unsafe {
            engine.submit(ops, move |completion| {
                if seen
                    .lock()
                    .insert(completion.deadline_ms, completion)
                    .is_some()
                {
                    duplicates.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
        .unwrap();
    }

    assert!(engine.wait_idle(DRAIN));
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(seen.lock().len() as i64, expected_ops);
    assert_eq!(engine.pending_ops(), 0);
    assert_eq!(engine.live_buffers(), 0);

    let stats = engine.backend().stats();
    assert_eq!(stats.pinned_allocs, 20);
    assert_eq!(stats.pinned_frees, 20);
    assert_eq!(stats.events_recorded, stats.events_destroyed);
    assert_eq!(stats.copies as i64, expected_ops);
}

#[test]
fn concurrent_submitters_with_latest_wins() {
    let engine = Arc::new(engine(1, CallbackPolicy::LatestWins));
    let delivered = Arc::new(AtomicUsize::new(0));
    let mut device = vec![0u8; 4096];
    let base = device.as_mut_ptr() as usize as u64;

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                for _ in 0..25 {
                    let mut buffer = engine.acquire_host_buffer(256).unwrap();
                    buffer.as_mut_slice().fill(t as u8);
                    let delivered = Arc::clone(&delivered);
                    let dst = DevicePtr::new(base + t as u64 * 1024);
                    let ops = vec![CopyOperation::new(buffer, dst, 256).with_stream(t)];
                    // SAFETY: each thread writes its own 256-byte slice of
                    // `device`, which is only read after every thread joined.
                    unsafe {
                        engine.submit(ops, move |_| {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        })
                    }
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every callback closure counts into the same total, so the slot swaps
    // are invisible here; only the count matters.
    assert!(engine.wait_idle(DRAIN));
    assert_eq!(delivered.load(Ordering::SeqCst), 100);
    assert_eq!(engine.live_buffers(), 0);
    assert_eq!(engine.backend().stats().pinned_frees, 100);
    for t in 0..4 {
        assert!(device[t * 1024..t * 1024 + 256].iter().all(|&b| b == t as u8));
    }
}

#[test]
fn file_pages_reach_device_memory() {
    if io_uring::IoUring::new(2).is_err() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }

    const PAGE: usize = 4096;
    let contents: Vec<u8> = (0..PAGE * 37 + 11).map(|i| (i % 241) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&contents).unwrap();
    file.flush().unwrap();

    let engine = engine(1, CallbackPolicy::LatestWins);
    let reader = RangeReader::new(
        ReaderConfig::default()
            .with_chunk_size(3 * PAGE)
            .with_max_inflight(4),
    );
    let offset = PAGE as u64;
    let size = contents.len() - PAGE;

    let mut staging = engine.acquire_host_buffer(size).unwrap();
    let read = reader
        .read_range(file.path(), offset, size as u64, staging.as_mut_slice())
        .unwrap();
    assert_eq!(read, size as u64);

    let staging = Arc::new(staging);
    let mut device = vec![0u8; size];
    let ops: Vec<_> = (0..size)
        .step_by(PAGE)
        .enumerate()
        .map(|(i, start)| {
            let bytes = PAGE.min(size - start);
            CopyOperation::new(
                CopySource::pinned_at(Arc::clone(&staging), start),
                DevicePtr::from(device[start..].as_mut_ptr()),
                bytes,
            )
            .with_stream(i as i32)
        })
        .collect();
    let pages = ops.len();
    drop(staging);

    let bytes_done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&bytes_done);
    // SAFETY: `device` is only read after wait_idle drained every copy.
    unsafe {
        engine.submit(ops, move |c| {
            counter.fetch_add(c.bytes, Ordering::SeqCst);
        })
    }
    .unwrap();

    assert!(engine.wait_idle(DRAIN));
    assert_eq!(pages, 37);
    assert_eq!(bytes_done.load(Ordering::SeqCst), size);
    assert_eq!(device, &contents[PAGE..]);
    assert_eq!(engine.live_buffers(), 0);
}
