//! Append-path benchmarks.
//!
//! Run with: cargo bench --package lodestream-log

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lodestream_log::{CommitLog, LogConfig, Message};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn bench_single_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("append");

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_message", |b| {
        let dir = TempDir::new().unwrap();
        let log = rt.block_on(async {
            CommitLog::open(LogConfig::new(dir.path())).await.unwrap()
        });

        b.to_async(&rt).iter(|| {
            let log = Arc::clone(&log);
            async move {
                let message = Message::new(vec![0u8; 100]);
                black_box(log.append(&[message]).await.unwrap());
            }
        });
    });

    group.finish();
}

fn bench_batch_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("batch_append");

    for batch_size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let log = rt.block_on(async {
                    CommitLog::open(LogConfig::new(dir.path())).await.unwrap()
                });

                b.to_async(&rt).iter(|| {
                    let log = Arc::clone(&log);
                    async move {
                        let batch: Vec<Message> =
                            (0..size).map(|_| Message::new(vec![0u8; 100])).collect();
                        black_box(log.append(&batch).await.unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_append, bench_batch_append);
criterion_main!(benches);
