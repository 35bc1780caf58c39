//! Performance benchmarks
//!
//! Measures pack's core operations across value sizes and access patterns:
//! - allocate/write/read/free throughput at different payload sizes
//! - commit latency for batches of varying size
//! - vacuum throughput after fragmenting a file

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pack::{Options, Pack};
use std::time::Duration;
use tempfile::tempdir;

fn generate_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

async fn open_test_pack() -> (Pack, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let mut options = Options::high_performance().unwrap();
    options.vacuum_interval_ms = None; // keep runs deterministic
    let pack = Pack::open(dir.path().join("bench.pack"), options).await.unwrap();
    (pack, dir)
}

fn bench_allocate_commit(c: &mut Criterion) {
    let value_sizes = [("1B", 1), ("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024), ("100KB", 100 * 1024)];

    let mut group = c.benchmark_group("allocate_commit");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    for (name, size) in value_sizes {
        group.throughput(Throughput::Bytes(size as u64 * 100));
        group.bench_with_input(BenchmarkId::new("sequential_allocate", name), &size, |b, &value_size| {
            b.iter_custom(|iters| {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    total += rt.block_on(async {
                        let (pack, _dir) = open_test_pack().await;
                        let payload = generate_payload(value_size);

                        let start = std::time::Instant::now();
                        let mut mutator = pack.mutate();
                        for _ in 0..100 {
                            let address = mutator.allocate(payload.len()).await.unwrap();
                            black_box(mutator.write(address, &payload).await.unwrap());
                        }
                        mutator.commit().await.unwrap();
                        let elapsed = start.elapsed();
                        pack.close().await.unwrap();
                        elapsed
                    });
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_read_throughput(c: &mut Criterion) {
    let value_sizes = [("1B", 1), ("1KB", 1024), ("10KB", 10 * 1024)];

    let mut group = c.benchmark_group("read_throughput");
    group.sample_size(20);

    for (name, size) in value_sizes {
        group.throughput(Throughput::Bytes(size as u64 * 100));
        group.bench_with_input(BenchmarkId::new("sequential_read", name), &size, |b, &value_size| {
            b.iter_custom(|iters| {
                let rt = tokio::runtime::Runtime::new().unwrap();
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    total += rt.block_on(async {
                        let (pack, _dir) = open_test_pack().await;
                        let payload = generate_payload(value_size);
                        let mut mutator = pack.mutate();
                        let mut addresses = Vec::with_capacity(100);
                        for _ in 0..100 {
                            let address = mutator.allocate(payload.len()).await.unwrap();
                            mutator.write(address, &payload).await.unwrap();
                            addresses.push(address);
                        }
                        mutator.commit().await.unwrap();

                        let reader = pack.mutate();
                        let start = std::time::Instant::now();
                        for &address in &addresses {
                            black_box(reader.read(address).await.unwrap());
                        }
                        let elapsed = start.elapsed();
                        pack.close().await.unwrap();
                        elapsed
                    });
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_vacuum_after_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("vacuum");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("reclaim_sparse_pages", |b| {
        b.iter_custom(|iters| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                total += rt.block_on(async {
                    let (pack, _dir) = open_test_pack().await;
                    let payload = generate_payload(256);

                    let mut mutator = pack.mutate();
                    let mut addresses = Vec::with_capacity(200);
                    for _ in 0..200 {
                        let address = mutator.allocate(payload.len()).await.unwrap();
                        mutator.write(address, &payload).await.unwrap();
                        addresses.push(address);
                    }
                    mutator.commit().await.unwrap();

                    let mut mutator = pack.mutate();
                    for &address in addresses.iter().step_by(2) {
                        mutator.free(address).await.unwrap();
                    }
                    mutator.commit().await.unwrap();

                    let start = std::time::Instant::now();
                    black_box(pack.vacuum().await.unwrap());
                    let elapsed = start.elapsed();
                    pack.close().await.unwrap();
                    elapsed
                });
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_allocate_commit, bench_read_throughput, bench_vacuum_after_fragmentation);
criterion_main!(benches);
