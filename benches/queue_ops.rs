//! Benchmarks for queue and rate limiter hot paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jobmirror::config::RateLimitPolicy;
use jobmirror::sync::{ClaimFilter, RateLimiter, SyncQueue};
use jobmirror::types::Priority;

const PRIORITIES: [Priority; 4] = [
    Priority::Low,
    Priority::Medium,
    Priority::High,
    Priority::Critical,
];

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue");

    for tables in [10usize, 100, 1000] {
        let names: Vec<String> = (0..tables).map(|i| format!("table_{}", i)).collect();
        group.throughput(Throughput::Elements(tables as u64));
        group.bench_with_input(BenchmarkId::new("distinct", tables), &names, |b, names| {
            b.iter(|| {
                let queue = SyncQueue::with_capacity(1000);
                for (i, name) in names.iter().enumerate() {
                    queue.enqueue(name, PRIORITIES[i % 4], false);
                }
                black_box(queue.len())
            })
        });
    }

    group.throughput(Throughput::Elements(1000));
    group.bench_function("coalesced", |b| {
        b.iter(|| {
            let queue = SyncQueue::with_capacity(1000);
            for i in 0..1000 {
                queue.enqueue("executions", PRIORITIES[i % 4], false);
            }
            black_box(queue.stats().coalesced)
        })
    });

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");

    for tables in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(tables as u64));
        group.bench_with_input(BenchmarkId::new("claim_complete", tables), &tables, |b, &n| {
            b.iter_batched(
                || {
                    let queue = SyncQueue::with_capacity(n);
                    for i in 0..n {
                        queue.enqueue(&format!("table_{}", i), PRIORITIES[i % 4], false);
                    }
                    queue
                },
                |queue| {
                    while let Some(task) = queue.try_dequeue(ClaimFilter::any()) {
                        queue.complete(&task);
                    }
                    black_box(queue.stats().completed)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    // saturates after the first burst; measures the admission check itself
    let limiter = RateLimiter::new(&RateLimitPolicy::default());

    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire().is_ok()))
    });
}

criterion_group!(benches, bench_enqueue, bench_drain, bench_rate_limiter);
criterion_main!(benches);
