//! End-to-end tests: raw CSV tree → ETL → partition-pruned queries.

use chrono::NaiveDate;
use polars::prelude::*;
use std::fs;
use std::path::PathBuf;
use vision_core::{DataKind, Interval, StorageLayout, TaskId};
use vision_store::ingest::day_bounds;
use vision_store::partition::StoreManifest;
use vision_store::transform::PartitionStatus;
use vision_store::{
    EtlMode, EtlTransformer, PartitionKey, PartitionStore, QueryEngine, QuerySpec, StoreError,
    LAYOUT_VERSION,
};

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

const HEADER: &str = "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore";
const H1: Option<Interval> = Some(Interval::H1);

struct Workspace {
    _dir: tempfile::TempDir,
    layout: StorageLayout,
    store: PartitionStore,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new("https://mirror.test/", dir.path().join("raw"));
        let store = PartitionStore::new(dir.path().join("store"));
        store.init().unwrap();
        Self {
            _dir: dir,
            layout,
            store,
        }
    }

    fn id(&self, symbol: &str, day: u32) -> TaskId {
        TaskId::new(DataKind::Klines, symbol, H1, date(day))
    }

    fn write_raw(&self, symbol: &str, day: u32, body: &str) -> PathBuf {
        let path = self.layout.csv_path(&self.id(symbol, day));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    fn etl(&self, mode: EtlMode) -> vision_store::TransformReport {
        EtlTransformer::new(self.layout.clone(), self.store.clone())
            .with_mode(mode)
            .run()
            .unwrap()
    }

    fn engine(&self) -> QueryEngine {
        QueryEngine::new(self.store.clone())
    }

    fn key(&self, symbol: &str, day: u32) -> PartitionKey {
        PartitionKey::from(&self.id(symbol, day))
    }
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
}

/// `hours` hourly klines starting at midnight of `day`, each with `volume`.
fn hourly_rows(day: u32, hours: i64, volume: f64) -> String {
    let (start, _) = day_bounds(date(day));
    (0..hours)
        .map(|h| {
            let open = start + h * 3_600_000;
            format!(
                "{open},100,101,99,100.5,{volume},{},{},10,1,100,0\n",
                open + 3_599_999,
                volume * 100.0
            )
        })
        .collect()
}

fn open_times(df: &DataFrame) -> Vec<i64> {
    df.column("open_time")
        .unwrap()
        .i64()
        .unwrap()
        .into_no_null_iter()
        .collect()
}

fn rows_in(store: &PartitionStore, key: &PartitionKey) -> usize {
    store.read(key).unwrap().height()
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[test]
fn two_day_example_builds_one_partition_per_day() {
    let ws = Workspace::new();
    // day 2's file also carries the last hour of day 1 and a duplicate row
    ws.write_raw("BTCUSDT", 1, &format!("{HEADER}\n{}", hourly_rows(1, 24, 1.0)));
    ws.write_raw(
        "BTCUSDT",
        2,
        &format!(
            "{HEADER}\n{}{}{}",
            hourly_rows(1, 24, 1.0).lines().last().unwrap().to_owned() + "\n",
            hourly_rows(2, 24, 1.0),
            hourly_rows(2, 1, 1.0)
        ),
    );

    let report = ws.etl(EtlMode::Resume);
    assert_eq!((report.written, report.failed), (2, 0));
    assert_eq!(report.rows_written, 48);

    for day in [1, 2] {
        let key = ws.key("BTCUSDT", day);
        let path = ws.store.parquet_path(&key);
        assert!(path.ends_with(format!(
            "data_type=klines/interval=1h/date=2025-01-0{day}/symbol=BTCUSDT.parquet"
        )));
        let df = ws.store.read(&key).unwrap();
        let (lo, hi) = day_bounds(date(day));
        assert_eq!(df.height(), 24);
        assert!(open_times(&df).iter().all(|t| *t >= lo && *t < hi));
        assert_eq!(ws.store.read_meta(&key).unwrap().rows, 24);
    }

    let result = ws
        .engine()
        .scan(&QuerySpec::for_dates(DataKind::Klines, H1, date(1), date(2)), None)
        .unwrap();
    assert_eq!(result.partitions_read, 2);
    assert_eq!(result.rows(), 48);
    let times = open_times(&result.frame);
    assert!(times.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn reruns_do_not_grow_row_counts() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.write_raw("BTCUSDT", 2, &hourly_rows(2, 24, 1.0));

    assert_eq!(ws.etl(EtlMode::Resume).written, 2);
    let again = ws.etl(EtlMode::Resume);
    assert_eq!((again.written, again.skipped), (0, 2));

    let forced = ws.etl(EtlMode::Force);
    assert_eq!(forced.written, 2);
    assert_eq!(rows_in(&ws.store, &ws.key("BTCUSDT", 1)), 24);
    assert_eq!(ws.store.list_partitions().unwrap().len(), 2);
}

#[test]
fn changed_source_is_rebuilt_in_resume_mode() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 12, 1.0));
    ws.write_raw("BTCUSDT", 2, &hourly_rows(2, 24, 1.0));
    ws.etl(EtlMode::Resume);

    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    let report = ws.etl(EtlMode::Resume);
    assert_eq!((report.written, report.skipped), (1, 1));
    assert_eq!(rows_in(&ws.store, &ws.key("BTCUSDT", 1)), 24);
}

#[test]
fn corrupt_source_fails_alone() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.write_raw("ETHUSDT", 1, "<html>rate limited</html>\nnot,a,csv\n");
    ws.write_raw("SOLUSDT", 1, "");

    let report = ws.etl(EtlMode::Resume);
    assert_eq!((report.written, report.failed), (1, 2));
    let failed: Vec<&str> = report.failures().map(|o| o.key.symbol.as_str()).collect();
    assert_eq!(failed, vec!["ETHUSDT", "SOLUSDT"]);
    assert!(report
        .failures()
        .all(|o| matches!(o.status, PartitionStatus::Failed { .. })));
    assert!(!ws.store.parquet_path(&ws.key("ETHUSDT", 1)).exists());
}

#[test]
fn corrupt_partition_is_skipped_by_queries_and_repaired_by_etl() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.write_raw("ETHUSDT", 1, &hourly_rows(1, 24, 2.0));
    ws.etl(EtlMode::Resume);

    let eth = ws.key("ETHUSDT", 1);
    fs::write(ws.store.parquet_path(&eth), b"truncated write").unwrap();

    let spec = QuerySpec::for_dates(DataKind::Klines, H1, date(1), date(1));
    let result = ws.engine().scan(&spec, None).unwrap();
    assert_eq!(result.rows(), 24);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].key, eth);

    let report = ws.etl(EtlMode::Resume);
    assert_eq!((report.written, report.skipped), (1, 1));
    assert_eq!(ws.engine().scan(&spec, None).unwrap().rows(), 48);
}

#[test]
fn queries_only_touch_covering_partitions() {
    let ws = Workspace::new();
    for day in 1..=5 {
        ws.write_raw("BTCUSDT", day, &hourly_rows(day, 24, 1.0));
        ws.write_raw("ETHUSDT", day, &hourly_rows(day, 24, 1.0));
    }
    ws.etl(EtlMode::Resume);

    // a corrupt partition outside the range must not even be opened
    fs::write(ws.store.parquet_path(&ws.key("BTCUSDT", 5)), b"").unwrap();

    let engine = ws.engine();
    let spec = QuerySpec::for_dates(DataKind::Klines, H1, date(2), date(3))
        .with_symbols(vec!["BTCUSDT".into()]);
    assert_eq!(
        engine.plan(&spec).unwrap(),
        vec![ws.key("BTCUSDT", 2), ws.key("BTCUSDT", 3)]
    );
    let result = engine.scan(&spec, Some(10)).unwrap();
    assert_eq!(result.partitions_read, 2);
    assert!(result.skipped.is_empty());
    assert_eq!(result.rows(), 10);
    assert_eq!(open_times(&result.frame)[0], day_bounds(date(2)).0);
}

#[test]
fn widest_range_plans_only_stored_dates() {
    let ws = Workspace::new();
    for day in [3, 7] {
        ws.write_raw("BTCUSDT", day, &hourly_rows(day, 24, 1.0));
    }
    ws.etl(EtlMode::Resume);

    // from the epoch to the last millisecond of year 9999
    let spec = QuerySpec::new(DataKind::Klines, H1, 0, 253_402_300_799_999);
    assert_eq!(
        ws.engine().plan(&spec).unwrap(),
        vec![ws.key("BTCUSDT", 3), ws.key("BTCUSDT", 7)]
    );

    let empty = Workspace::new();
    assert!(empty.engine().plan(&spec).unwrap().is_empty());
}

#[test]
fn series_respects_millisecond_bounds() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.write_raw("BTCUSDT", 2, &hourly_rows(2, 24, 1.0));
    ws.etl(EtlMode::Resume);

    let (_, day1_end) = day_bounds(date(1));
    // last two hours of day 1 and first three of day 2
    let start = day1_end - 2 * 3_600_000;
    let end = day1_end + 2 * 3_600_000;
    let result = ws
        .engine()
        .series(DataKind::Klines, H1, "BTCUSDT", start, end, None)
        .unwrap();
    assert_eq!(result.rows(), 5);
    assert_eq!(result.partitions_read, 2);
}

#[test]
fn volume_ranking_orders_symbols_by_total() {
    let ws = Workspace::new();
    ws.write_raw("AAAUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.write_raw("BBBUSDT", 1, &hourly_rows(1, 24, 3.0));
    ws.write_raw("CCCUSDT", 1, &hourly_rows(1, 24, 2.0));
    ws.etl(EtlMode::Resume);

    let spec = QuerySpec::for_dates(DataKind::Klines, H1, date(1), date(1));
    let result = ws.engine().volume_ranking(&spec, Some(2)).unwrap();
    let symbols: Vec<&str> = result
        .frame
        .column("symbol")
        .unwrap()
        .str()
        .unwrap()
        .into_no_null_iter()
        .collect();
    assert_eq!(symbols, vec!["BBBUSDT", "CCCUSDT"]);
    let totals: Vec<f64> = result
        .frame
        .column("total")
        .unwrap()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect();
    assert_eq!(totals, vec![72.0, 48.0]);

    let missing = ws.engine().sum_by_symbol(&spec, "no_such_column", None);
    assert!(matches!(missing, Err(StoreError::InvalidQuery(_))));
}

#[test]
fn empty_range_reports_no_partitions() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    ws.etl(EtlMode::Resume);

    let spec = QuerySpec::for_dates(DataKind::Klines, H1, date(10), date(11));
    assert!(matches!(
        ws.engine().scan(&spec, None),
        Err(StoreError::NoPartitions)
    ));
}

#[test]
fn stale_layout_version_aborts_etl() {
    let ws = Workspace::new();
    ws.write_raw("BTCUSDT", 1, &hourly_rows(1, 24, 1.0));
    let manifest = StoreManifest {
        layout_version: LAYOUT_VERSION + 1,
        created_at: chrono::Utc::now().naive_utc(),
    };
    fs::write(
        ws.store.manifest_path(),
        serde_json::to_string(&manifest).unwrap(),
    )
    .unwrap();

    let result = EtlTransformer::new(ws.layout.clone(), ws.store.clone()).run();
    assert!(matches!(result, Err(StoreError::LayoutVersion { .. })));
    assert!(!ws.store.parquet_path(&ws.key("BTCUSDT", 1)).exists());
}
