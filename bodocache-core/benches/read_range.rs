use std::io::Write;

use bodocache_core::{RangeReader, ReaderConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::NamedTempFile;

const FILE_BYTES: usize = 64 << 20;

fn fixture() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    let block: Vec<u8> = (0..1 << 20).map(|i| (i & 0xFF) as u8).collect();
    for _ in 0..FILE_BYTES / block.len() {
        file.write_all(&block).expect("write fixture");
    }
    file.flush().expect("flush fixture");
    file
}

fn bench_read_range(c: &mut Criterion) {
    let file = fixture();
    let mut out = vec![0u8; FILE_BYTES];

    let mut group = c.benchmark_group("read_range");
    group.throughput(Throughput::Bytes(FILE_BYTES as u64));
    group.sample_size(20);

    for (chunk_kib, max_inflight) in [(1024usize, 1usize), (1024, 4), (256, 8), (4096, 2)] {
        let reader = RangeReader::new(
            ReaderConfig::default()
                .with_chunk_size(chunk_kib << 10)
                .with_max_inflight(max_inflight),
        );
        let id = BenchmarkId::new(format!("chunk_{chunk_kib}k"), max_inflight);
        group.bench_with_input(id, &reader, |b, reader| {
            b.iter(|| {
                let read = reader
                    .read_range(file.path(), 0, FILE_BYTES as u64, &mut out)
                    .expect("read_range");
                assert_eq!(read, FILE_BYTES as u64);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_read_range);
criterion_main!(benches);
