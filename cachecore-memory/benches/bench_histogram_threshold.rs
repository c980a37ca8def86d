use cachecore_memory::histogram::{target_pct, ScoreHistogram};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn populated_histogram(entries: usize) -> ScoreHistogram {
    let mut histogram = ScoreHistogram::new();
    for i in 0..entries {
        // Log-spaced scores and byte sizes so every bucket sees some weight,
        // not just the low end.
        let score = 0.01 * 1.07f64.powi(i as i32 % 200);
        let bytes = 64 + (i % 4096);
        histogram.record(score, bytes);
    }
    histogram
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");

    for entries in [1_000, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            b.iter(|| {
                let mut histogram = ScoreHistogram::new();
                for i in 0..entries {
                    let score = 0.01 * 1.07f64.powi(i as i32 % 200);
                    histogram.record(black_box(score), black_box(64 + (i % 4096)));
                }
            });
        });
    }

    group.finish();
}

fn bench_threshold_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("threshold_for");
    let histogram = populated_histogram(50_000);

    for usage in [0.2, 0.5, 0.8, 0.95].iter() {
        let bytes_to_free = target_pct(*usage) * 50_000.0 * 2048.0;
        group.bench_with_input(
            BenchmarkId::from_parameter(usage),
            &bytes_to_free,
            |b, &bytes_to_free| {
                b.iter(|| black_box(histogram.threshold_for(bytes_to_free)));
            },
        );
    }

    group.finish();
}

fn bench_merge_ema(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_ema");
    let building = populated_histogram(50_000);

    group.bench_function("merge_into_persistent", |b| {
        b.iter(|| {
            let mut persistent = ScoreHistogram::new();
            persistent.merge_ema(black_box(&building), 0.3);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_record, bench_threshold_for, bench_merge_ema);
criterion_main!(benches);
