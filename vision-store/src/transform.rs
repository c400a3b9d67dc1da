//! ETL: raw CSV tree → partitioned Parquet store.
//!
//! Each raw CSV maps to exactly one partition, so partitions are built in
//! parallel with one writer each. Output files are always rewritten whole,
//! never appended to, which keeps re-runs from growing row counts.

use crate::error::StoreError;
use crate::ingest::CsvIngestor;
use crate::partition::{PartitionKey, PartitionMeta, PartitionStore};
use crate::schema::KindSchema;
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vision_core::resume::FileState;
use vision_core::{DataKind, StorageLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EtlMode {
    /// Skip partitions that are valid and built from the current source.
    #[default]
    Resume,
    /// Rebuild every partition.
    Force,
}

/// Restricts which raw files an ETL run considers.
#[derive(Debug, Clone, Default)]
pub struct EtlFilter {
    pub kinds: Option<Vec<DataKind>>,
    pub symbols: Option<Vec<String>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl EtlFilter {
    pub fn matches(&self, key: &PartitionKey) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&key.kind))
            && self.symbols.as_ref().map_or(true, |s| s.contains(&key.symbol))
            && self.start.map_or(true, |d| key.date >= d)
            && self.end.map_or(true, |d| key.date <= d)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionStatus {
    Written { rows: usize },
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    pub key: PartitionKey,
    pub source: PathBuf,
    #[serde(flatten)]
    pub status: PartitionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: usize,
    pub outcomes: Vec<PartitionOutcome>,
    pub elapsed: Duration,
}

impl TransformReport {
    fn from_outcomes(outcomes: Vec<PartitionOutcome>, elapsed: Duration) -> Self {
        let mut report = Self {
            written: 0,
            skipped: 0,
            failed: 0,
            rows_written: 0,
            outcomes: Vec::new(),
            elapsed,
        };
        for o in &outcomes {
            match o.status {
                PartitionStatus::Written { rows } => {
                    report.written += 1;
                    report.rows_written += rows;
                }
                PartitionStatus::Skipped => report.skipped += 1,
                PartitionStatus::Failed { .. } => report.failed += 1,
            }
        }
        report.outcomes = outcomes;
        report
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PartitionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, PartitionStatus::Failed { .. }))
    }
}

pub struct EtlTransformer {
    layout: StorageLayout,
    store: PartitionStore,
    mode: EtlMode,
    filter: EtlFilter,
}

impl EtlTransformer {
    pub fn new(layout: StorageLayout, store: PartitionStore) -> Self {
        Self {
            layout,
            store,
            mode: EtlMode::default(),
            filter: EtlFilter::default(),
        }
    }

    pub fn with_mode(mut self, mode: EtlMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: EtlFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Raw sources this run would consider, in key order.
    pub fn discover(&self) -> Result<Vec<(PartitionKey, PathBuf)>, StoreError> {
        let found = self
            .layout
            .discover_csv_files()
            .map_err(|e| StoreError::Raw(format!("walking {}: {e}", self.layout.raw_root().display())))?;
        Ok(found
            .into_iter()
            .map(|(id, path)| (PartitionKey::from(&id), path))
            .filter(|(key, _)| self.filter.matches(key))
            .collect())
    }

    /// Build every discovered partition.
    ///
    /// Only store-level problems (layout version, unreadable raw tree) are
    /// returned as errors; per-partition failures land in the report.
    pub fn run(&self) -> Result<TransformReport, StoreError> {
        let started = Instant::now();
        self.store.check_layout()?;
        let sources = self.discover()?;
        info!(partitions = sources.len(), mode = ?self.mode, "starting ETL");

        let outcomes: Vec<PartitionOutcome> = sources
            .par_iter()
            .map(|(key, source)| {
                let status = match self.build(key, source) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(partition = %key, error = %e, "partition failed");
                        PartitionStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                PartitionOutcome {
                    key: key.clone(),
                    source: source.clone(),
                    status,
                }
            })
            .collect();

        let report = TransformReport::from_outcomes(outcomes, started.elapsed());
        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failed,
            rows = report.rows_written,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "ETL finished"
        );
        Ok(report)
    }

    fn build(&self, key: &PartitionKey, source: &Path) -> Result<PartitionStatus, StoreError> {
        let bytes = fs::read(source)?;
        let source_hash = blake3::hash(&bytes).to_hex().to_string();

        if self.mode == EtlMode::Resume {
            match self.store.inspect(key) {
                FileState::PresentValid => {
                    let current = self
                        .store
                        .read_meta(key)
                        .is_some_and(|m| m.source_hash == source_hash);
                    if current {
                        debug!(partition = %key, "up to date, skipping");
                        return Ok(PartitionStatus::Skipped);
                    }
                    info!(partition = %key, "source changed, rebuilding");
                }
                FileState::PresentInvalid(reason) => {
                    warn!(partition = %key, reason = %reason, "invalid partition, rebuilding");
                }
                FileState::Missing => {}
            }
        }

        let ingested = CsvIngestor::new(KindSchema::for_kind(key.kind)).ingest_bytes(&bytes, key, source)?;
        if ingested.out_of_day > 0 || ingested.duplicates > 0 {
            debug!(
                partition = %key,
                out_of_day = ingested.out_of_day,
                duplicates = ingested.duplicates,
                "dropped rows"
            );
        }

        let mut frame = ingested.frame;
        let meta = PartitionMeta {
            rows: frame.height(),
            min_time: ingested.min_time,
            max_time: ingested.max_time,
            source: source.display().to_string(),
            source_hash,
            written_at: chrono::Utc::now().naive_utc(),
        };
        self.store.write(key, &mut frame, &meta)?;
        Ok(PartitionStatus::Written { rows: meta.rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vision_core::{Interval, TaskId};

    fn key(kind: DataKind, symbol: &str, day: u32) -> PartitionKey {
        PartitionKey {
            kind,
            interval: kind.has_interval().then_some(Interval::D1),
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            symbol: symbol.into(),
        }
    }

    #[test]
    fn filter_matches_on_every_dimension() {
        let k = key(DataKind::Klines, "BTCUSDT", 5);
        assert!(EtlFilter::default().matches(&k));

        let by_kind = EtlFilter {
            kinds: Some(vec![DataKind::Trades]),
            ..Default::default()
        };
        assert!(!by_kind.matches(&k));

        let by_symbol = EtlFilter {
            symbols: Some(vec!["BTCUSDT".into()]),
            ..Default::default()
        };
        assert!(by_symbol.matches(&k));

        let by_date = EtlFilter {
            start: Some(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()),
            ..Default::default()
        };
        assert!(!by_date.matches(&k));
    }

    #[test]
    fn report_counts_statuses() {
        let outcome = |status| PartitionOutcome {
            key: key(DataKind::Trades, "BTCUSDT", 1),
            source: PathBuf::from("x.csv"),
            status,
        };
        let report = TransformReport::from_outcomes(
            vec![
                outcome(PartitionStatus::Written { rows: 10 }),
                outcome(PartitionStatus::Written { rows: 5 }),
                outcome(PartitionStatus::Skipped),
                outcome(PartitionStatus::Failed { error: "bad".into() }),
            ],
            Duration::ZERO,
        );
        assert_eq!(
            (report.written, report.skipped, report.failed, report.rows_written),
            (2, 1, 1, 15)
        );
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn discover_maps_raw_files_to_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new("https://example.test/", dir.path().join("raw"));
        let id = TaskId::new(
            DataKind::Trades,
            "BTCUSDT",
            None,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        );
        let csv = layout.csv_path(&id);
        fs::create_dir_all(csv.parent().unwrap()).unwrap();
        fs::write(&csv, "1,100,1,100,1735689600100,false\n").unwrap();

        let etl = EtlTransformer::new(layout, PartitionStore::new(dir.path().join("store")));
        let found = etl.discover().unwrap();
        assert_eq!(found, vec![(PartitionKey::from(&id), csv)]);
    }
}
