#[macro_use]
extern crate criterion;

use criterion::{BenchmarkId, Criterion};

use pixelguard_core::model::Snapshot;
use pixelguard_detection::PatternIndex;

fn corpus(domains: usize) -> Snapshot {
    let patterns: Vec<String> = (0..domains).map(|i| format!("tracker{i}.example.com")).collect();
    Snapshot::from_sources([("bench", patterns)])
}

fn bench_index_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_lookup");

    for domains in [100, 10_000, 100_000] {
        let index = PatternIndex::default();
        index.rebuild(&corpus(domains)).unwrap();
        let hit = format!("https://www.tracker{}.example.com/p.gif?id=7", domains / 2);
        let miss = "https://static.unlisted.org/logo.png";

        group.throughput(criterion::Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", domains), &hit, |b, url| {
            b.iter(|| index.lookup(url));
        });
        group.bench_with_input(BenchmarkId::new("miss", domains), &miss, |b, url| {
            b.iter(|| index.lookup(url));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_index_lookup);
criterion_main!(benches);
