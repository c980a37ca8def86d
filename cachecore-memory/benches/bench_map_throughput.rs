use std::sync::Arc;
use std::thread;

use cachecore_memory::cache::Cache;
use cachecore_memory::config::{CacheOptions, GlobalPolicyConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn new_cache(max_memory: u64) -> Arc<Cache<String, i64>> {
    let options = CacheOptions { max_memory, ..CacheOptions::default() };
    Cache::new(options, GlobalPolicyConfig::default())
}

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let cache = new_cache(0);
                for i in 0..size {
                    cache.upsert(format!("key{i}"), black_box(i as i64), 64, None);
                }
            });
        });
    }

    group.finish();
}

fn bench_find_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_hit");

    for size in [100, 1_000, 10_000].iter() {
        let cache = new_cache(0);
        for i in 0..*size {
            cache.upsert(format!("key{i}"), i as i64, 64, None);
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(cache.find(&format!("key{i}")));
                }
            });
        });
    }

    group.finish();
}

fn bench_concurrent_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_mixed");

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let cache = new_cache(0);
                    let handles: Vec<_> = (0..num_threads)
                        .map(|thread_id| {
                            let cache = cache.clone();
                            thread::spawn(move || {
                                for i in 0..200 {
                                    let key = format!("key{}", thread_id * 200 + i);
                                    if i % 10 == 0 {
                                        cache.upsert(key, black_box(i as i64), 64, None);
                                    } else {
                                        black_box(cache.find(&key));
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_eviction_under_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction_under_pressure");

    group.bench_function("insert_beyond_budget", |b| {
        b.iter(|| {
            let cache = new_cache(64 * 512);
            for i in 0..2_000 {
                cache.upsert(format!("key{i}"), black_box(i as i64), 64, None);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_find_hit,
    bench_concurrent_mixed,
    bench_eviction_under_pressure
);
criterion_main!(benches);
