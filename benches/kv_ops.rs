//! Operation benchmarks for hybridkv
//!
//! - single-session upsert, read, RMW and a 50/50 mix over resident records
//! - reads that go pending against a file-backed log
//! - several sessions incrementing shared counters

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;

use hybridkv::{FasterKv, FileSystemDisk, KvConfig, MemoryDevice, SimpleFunctions, Status};

type U64Functions = SimpleFunctions<u64, u64>;

fn create_store(table_size: u64, memory_size: u64) -> Arc<FasterKv<U64Functions, MemoryDevice>> {
    let config = KvConfig::new(table_size, memory_size).with_page_size_bits(20);
    FasterKv::new(config, U64Functions::new(), MemoryDevice::new()).unwrap()
}

const NUM_KEYS: u64 = 100_000;

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));

    let store = create_store(1 << 18, 1 << 27);
    let mut session = store.start_session().unwrap();
    let mut key = 0u64;

    group.bench_function("sequential", |b| {
        b.iter(|| {
            let status = session.upsert(black_box(&(key % NUM_KEYS)), black_box(&key), ());
            key += 1;
            status
        })
    });

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));

    let store = create_store(1 << 18, 1 << 27);
    let mut session = store.start_session().unwrap();
    for key in 0..NUM_KEYS {
        session.upsert(&key, &(key * 10), ());
    }

    let mut rng = StdRng::seed_from_u64(7);
    group.bench_function("uniform_resident", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..NUM_KEYS);
            let mut output = None;
            let status = session.read(black_box(&key), 0, &mut output, ());
            black_box(output);
            status
        })
    });

    group.finish();
}

fn bench_rmw(c: &mut Criterion) {
    let mut group = c.benchmark_group("rmw");
    group.throughput(Throughput::Elements(1));

    let store = create_store(1 << 18, 1 << 27);
    let mut session = store.start_session().unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    group.bench_function("uniform_in_place", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..NUM_KEYS);
            session.rmw(black_box(&key), key, ())
        })
    });

    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.throughput(Throughput::Elements(1));

    for read_percent in [50u32, 95] {
        let store = create_store(1 << 18, 1 << 27);
        let mut session = store.start_session().unwrap();
        for key in 0..NUM_KEYS {
            session.upsert(&key, &key, ());
        }
        let mut rng = StdRng::seed_from_u64(u64::from(read_percent));

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{read_percent}_read")),
            &read_percent,
            |b, &read_percent| {
                b.iter(|| {
                    let key = rng.gen_range(0..NUM_KEYS);
                    if rng.gen_range(0..100) < read_percent {
                        let mut output = None;
                        session.read(&key, 0, &mut output, ())
                    } else {
                        session.upsert(&key, &(key + 1), ())
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_pending_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_read");
    group.throughput(Throughput::Elements(64));
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    let device = FileSystemDisk::single_file(dir.path().join("hlog.dat")).unwrap();
    let config = KvConfig::new(1 << 16, 1 << 22).with_page_size_bits(16);
    let store = FasterKv::new(config, U64Functions::new(), device).unwrap();
    let mut session = store.start_session().unwrap();
    for key in 0..NUM_KEYS {
        session.upsert(&key, &key, ());
    }
    store.flush_and_evict_all().unwrap();

    let mut rng = StdRng::seed_from_u64(13);
    group.bench_function("batch_of_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let key = rng.gen_range(0..NUM_KEYS);
                let mut output = None;
                let status = session.read(&key, 0, &mut output, ());
                debug_assert!(matches!(status, Status::Pending | Status::Ok));
            }
            session.complete_pending(true)
        })
    });

    group.finish();
}

fn bench_concurrent_rmw(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_rmw");
    group.sample_size(10);

    for threads in [1u64, 2, 4] {
        const OPS_PER_THREAD: u64 = 50_000;
        group.throughput(Throughput::Elements(threads * OPS_PER_THREAD));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let store = create_store(1 << 14, 1 << 25);
                let workers: Vec<_> = (0..threads)
                    .map(|t| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            let mut session = store.start_session().unwrap();
                            let mut rng = StdRng::seed_from_u64(t);
                            for _ in 0..OPS_PER_THREAD {
                                session.rmw(&rng.gen_range(0..1024u64), 1, ());
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_upsert,
    bench_read,
    bench_rmw,
    bench_mixed,
    bench_pending_reads,
    bench_concurrent_rmw
);
criterion_main!(benches);
