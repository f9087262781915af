//! Benchmarks for throttler dispatch
//!
//! This benchmark measures:
//! - Round trip of a single task through an idle read lane
//! - Throughput of a burst of tasks under different in-flight ceilings
//! - Credential cache lookups for an existing identity

use cloud_provisioner::cache::ThrottlerCache;
use cloud_provisioner::config::{LaneConfig, RetryConfig, ThrottlerConfig};
use cloud_provisioner::connector::{InMemoryProvider, Operation};
use cloud_provisioner::throttler::Throttler;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn throttler(rt: &tokio::runtime::Runtime, ceiling: usize) -> Arc<Throttler> {
    let config = ThrottlerConfig::new()
        .with_read(LaneConfig::new(ceiling))
        .with_retry(RetryConfig::new(0));
    let throttler = Arc::new(Throttler::new(
        "bench",
        config,
        Arc::new(InMemoryProvider::new()),
    ));
    let _guard = rt.enter();
    throttler.start().unwrap();
    throttler
}

fn bench_single_task(c: &mut Criterion) {
    let rt = runtime();
    let throttler = throttler(&rt, 8);
    let params = json!({ "image_id": "img" });

    c.bench_function("read_lane_round_trip", |b| {
        b.to_async(&rt).iter(|| {
            let handle = throttler.execute_task(Operation::ListInstances, black_box(params.clone()));
            async move { handle.await.unwrap() }
        })
    });
}

fn bench_burst(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("read_lane_burst");
    const BURST: usize = 100;
    group.throughput(Throughput::Elements(BURST as u64));

    for ceiling in [1usize, 4, 16] {
        let throttler = throttler(&rt, ceiling);
        group.bench_with_input(BenchmarkId::from_parameter(ceiling), &ceiling, |b, _| {
            b.to_async(&rt).iter(|| {
                let handles: Vec<_> = (0..BURST)
                    .map(|i| throttler.execute_task(Operation::ListInstances, json!({ "image_id": format!("img-{}", i % 4) })))
                    .collect();
                async move {
                    for result in join_all(handles).await {
                        result.unwrap();
                    }
                }
            })
        });
    }
    group.finish();
}

fn bench_cache_lookup(c: &mut Criterion) {
    let rt = runtime();
    let _guard = rt.enter();
    let cache = ThrottlerCache::with_provider(ThrottlerConfig::default(), Arc::new(InMemoryProvider::new()));
    cache.get_or_create_by_env("AZURE", "sub-1").unwrap();

    c.bench_function("cache_hit", |b| {
        b.iter(|| cache.get_or_create_by_env(black_box("AZURE"), black_box("sub-1")).unwrap())
    });
}

criterion_group!(benches, bench_single_task, bench_burst, bench_cache_lookup);
criterion_main!(benches);
