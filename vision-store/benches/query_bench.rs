//! Criterion benchmarks for the query hot paths.
//!
//! Benchmarks:
//! 1. Partition pruning over an in-memory key list
//! 2. Full scan of a small on-disk store
//! 3. Per-symbol volume ranking

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use chrono::NaiveDate;
use std::fs;

use vision_core::{DataKind, Interval, StorageLayout, TaskId};
use vision_store::ingest::day_bounds;
use vision_store::{
    covering_keys, EtlTransformer, PartitionKey, PartitionStore, QueryEngine, QuerySpec,
};

const SYMBOLS: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];

// ── Helpers ──────────────────────────────────────────────────────────

fn date(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(offset)
}

fn make_keys(days: i64) -> Vec<PartitionKey> {
    (0..days)
        .flat_map(|d| {
            SYMBOLS.iter().map(move |s| PartitionKey {
                kind: DataKind::Klines,
                interval: Some(Interval::M5),
                date: date(d),
                symbol: s.to_string(),
            })
        })
        .collect()
}

fn minute_klines(day: NaiveDate) -> String {
    let (start, _) = day_bounds(day);
    (0..288)
        .map(|i| {
            let open = start + i * 300_000;
            let close = 100.0 + (i as f64 * 0.1).sin();
            format!(
                "{open},{close},{},{},{close},{},{},{},5,1,1,0\n",
                close + 0.5,
                close - 0.5,
                1.0 + (i % 7) as f64,
                open + 299_999,
                close * 2.0
            )
        })
        .collect()
}

/// A store with `days` × 4 symbols of 5m klines.
fn make_store(days: i64) -> (tempfile::TempDir, QueryEngine) {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new("https://bench.invalid/", dir.path().join("raw"));
    let store = PartitionStore::new(dir.path().join("store"));
    store.init().unwrap();

    for d in 0..days {
        for symbol in SYMBOLS {
            let id = TaskId::new(DataKind::Klines, symbol, Some(Interval::M5), date(d));
            let path = layout.csv_path(&id);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, minute_klines(date(d))).unwrap();
        }
    }
    EtlTransformer::new(layout, store.clone()).run().unwrap();
    (dir, QueryEngine::new(store))
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("covering_keys");
    for days in [30, 365] {
        let keys = make_keys(days);
        let spec = QuerySpec::for_dates(DataKind::Klines, Some(Interval::M5), date(10), date(16))
            .with_symbols(vec!["ETHUSDT".into()]);
        group.bench_with_input(BenchmarkId::from_parameter(days), &keys, |b, keys| {
            b.iter(|| covering_keys(black_box(&spec), black_box(keys)));
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let (_dir, engine) = make_store(7);
    let spec = QuerySpec::for_dates(DataKind::Klines, Some(Interval::M5), date(0), date(6));

    let mut group = c.benchmark_group("query");
    group.sample_size(20);
    group.bench_function("scan_7d_4sym", |b| {
        b.iter(|| engine.scan(black_box(&spec), None).unwrap());
    });
    group.bench_function("volume_ranking_7d_4sym", |b| {
        b.iter(|| engine.volume_ranking(black_box(&spec), None).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_pruning, bench_scan);
criterion_main!(benches);
