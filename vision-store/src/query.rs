//! Partition-pruned, read-only queries over the store.
//!
//! Pruning happens before any file is opened: only date directories inside
//! the requested range are listed, and only partitions of the requested
//! kind, interval and symbols are read. Corrupt partitions are skipped and
//! reported, never served.

use crate::error::StoreError;
use crate::ingest::day_bounds;
use crate::partition::{PartitionKey, PartitionStore};
use crate::schema::{KindSchema, SYMBOL_COLUMN};
use chrono::{DateTime, NaiveDate};
use polars::prelude::*;
use rayon::prelude::*;
use tracing::{debug, warn};
use vision_core::{DataKind, Interval};

/// Time-range × symbol-set selection over one kind (and interval).
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub kind: DataKind,
    pub interval: Option<Interval>,
    /// Inclusive, epoch milliseconds.
    pub start_ms: i64,
    /// Inclusive, epoch milliseconds.
    pub end_ms: i64,
    /// `None` selects every symbol.
    pub symbols: Option<Vec<String>>,
}

impl QuerySpec {
    pub fn new(kind: DataKind, interval: Option<Interval>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            kind,
            interval,
            start_ms,
            end_ms,
            symbols: None,
        }
    }

    /// Whole UTC days from `start` through `end`.
    pub fn for_dates(kind: DataKind, interval: Option<Interval>, start: NaiveDate, end: NaiveDate) -> Self {
        let (start_ms, _) = day_bounds(start);
        let (_, end_excl) = day_bounds(end);
        Self::new(kind, interval, start_ms, end_excl - 1)
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.kind.has_interval() != self.interval.is_some() {
            return Err(StoreError::InvalidQuery(match self.interval {
                Some(iv) => format!("{} has no intervals (got {iv})", self.kind),
                None => format!("{} requires an interval", self.kind),
            }));
        }
        if self.start_ms > self.end_ms {
            return Err(StoreError::InvalidQuery(format!(
                "start {} is after end {}",
                self.start_ms, self.end_ms
            )));
        }
        self.date_span()
            .map(|_| ())
            .ok_or_else(|| StoreError::InvalidQuery("time range out of bounds".into()))
    }

    /// First and last UTC day touched by the range.
    fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = DateTime::from_timestamp_millis(self.start_ms)?.date_naive();
        let last = DateTime::from_timestamp_millis(self.end_ms)?.date_naive();
        (first <= last).then_some((first, last))
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        match self.date_span() {
            Some((first, last)) => vision_core::planner::date_range(first, last),
            None => Vec::new(),
        }
    }

    fn selects_symbol(&self, symbol: &str) -> bool {
        self.symbols
            .as_ref()
            .map_or(true, |s| s.iter().any(|x| x == symbol))
    }
}

/// Partitions of `available` that can hold rows for `spec`, sorted.
///
/// A partition is included iff it has the selected kind and interval, its
/// UTC day intersects `[start_ms, end_ms]` and its symbol is selected.
pub fn covering_keys(spec: &QuerySpec, available: &[PartitionKey]) -> Vec<PartitionKey> {
    let Some((first, last)) = spec.date_span() else {
        return Vec::new();
    };
    let mut keys: Vec<PartitionKey> = available
        .iter()
        .filter(|k| {
            k.kind == spec.kind
                && k.interval == spec.interval
                && k.date >= first
                && k.date <= last
                && spec.selects_symbol(&k.symbol)
        })
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Debug, Clone)]
pub struct SkippedPartition {
    pub key: PartitionKey,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub frame: DataFrame,
    pub partitions_read: usize,
    pub skipped: Vec<SkippedPartition>,
}

impl QueryResult {
    pub fn rows(&self) -> usize {
        self.frame.height()
    }
}

/// Read-only query façade over a [`PartitionStore`].
#[derive(Debug, Clone)]
pub struct QueryEngine {
    store: PartitionStore,
}

impl QueryEngine {
    pub fn new(store: PartitionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Partitions a query would read.
    ///
    /// The kind directory is listed once and only the date directories that
    /// fall inside the range are opened, so cost follows the store, not the
    /// width of the range.
    pub fn plan(&self, spec: &QuerySpec) -> Result<Vec<PartitionKey>, StoreError> {
        spec.validate()?;
        let Some((first, last)) = spec.date_span() else {
            return Ok(Vec::new());
        };
        let mut available = Vec::new();
        for date in self.store.partition_dates(spec.kind, spec.interval)? {
            if (first..=last).contains(&date) {
                available.extend(self.store.keys_in_date_dir(spec.kind, spec.interval, date)?);
            }
        }
        Ok(covering_keys(spec, &available))
    }

    /// Rows of `spec`, sorted by time then symbol, deduplicated on the natural key.
    pub fn scan(&self, spec: &QuerySpec, limit: Option<usize>) -> Result<QueryResult, StoreError> {
        let schema = KindSchema::for_kind(spec.kind);
        let (lf, partitions_read, skipped) = self.load(spec)?;

        let mut sort_by = vec![schema.time_column, SYMBOL_COLUMN];
        sort_by.extend(schema.key_columns.iter().filter(|c| **c != schema.time_column));

        let mut lf = self
            .restrict(lf, spec, &schema)
            .sort(sort_by, SortMultipleOptions::default().with_maintain_order(true));
        if let Some(n) = limit {
            lf = lf.limit(n as IdxSize);
        }
        Ok(QueryResult {
            frame: lf.collect()?,
            partitions_read,
            skipped,
        })
    }

    /// Single-symbol series.
    pub fn series(
        &self,
        kind: DataKind,
        interval: Option<Interval>,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: Option<usize>,
    ) -> Result<QueryResult, StoreError> {
        let spec = QuerySpec::new(kind, interval, start_ms, end_ms).with_symbols(vec![symbol.to_string()]);
        self.scan(&spec, limit)
    }

    /// Total traded volume per symbol, largest first.
    pub fn volume_ranking(&self, spec: &QuerySpec, limit: Option<usize>) -> Result<QueryResult, StoreError> {
        let column = KindSchema::for_kind(spec.kind).volume_column.ok_or_else(|| {
            StoreError::InvalidQuery(format!("{} has no volume column", spec.kind))
        })?;
        self.sum_by_symbol(spec, column, limit)
    }

    /// Sum of a numeric column per symbol, largest first.
    ///
    /// The result has two columns: `symbol` and `total`.
    pub fn sum_by_symbol(
        &self,
        spec: &QuerySpec,
        column: &str,
        limit: Option<usize>,
    ) -> Result<QueryResult, StoreError> {
        let schema = KindSchema::for_kind(spec.kind);
        match schema.column(column) {
            Some(def) if def.ty.is_numeric() => {}
            Some(_) => {
                return Err(StoreError::InvalidQuery(format!("column {column} is not numeric")))
            }
            None => {
                return Err(StoreError::InvalidQuery(format!(
                    "{} has no column {column}",
                    spec.kind
                )))
            }
        }

        let (lf, partitions_read, skipped) = self.load(spec)?;
        let mut lf = self
            .restrict(lf, spec, &schema)
            .group_by([col(SYMBOL_COLUMN)])
            .agg([col(column).sum().alias("total")])
            .sort(
                ["total", SYMBOL_COLUMN],
                SortMultipleOptions::default()
                    .with_order_descending_multi([true, false])
                    .with_maintain_order(true),
            );
        if let Some(n) = limit {
            lf = lf.limit(n as IdxSize);
        }
        Ok(QueryResult {
            frame: lf.collect()?,
            partitions_read,
            skipped,
        })
    }

    /// Time filter plus cross-partition dedupe on key + symbol.
    fn restrict(&self, lf: LazyFrame, spec: &QuerySpec, schema: &KindSchema) -> LazyFrame {
        let time = col(schema.time_column);
        lf.filter(
            time.clone()
                .gt_eq(lit(spec.start_ms))
                .and(time.lt_eq(lit(spec.end_ms))),
        )
        .unique_stable(
            Some(schema.dedupe_columns().into_iter().map(Into::into).collect()),
            UniqueKeepStrategy::First,
        )
    }

    /// Read every covering partition; invalid ones are skipped and reported.
    fn load(&self, spec: &QuerySpec) -> Result<(LazyFrame, usize, Vec<SkippedPartition>), StoreError> {
        let keys = self.plan(spec)?;
        debug!(kind = %spec.kind, partitions = keys.len(), "query plan");

        let results: Vec<(PartitionKey, Result<DataFrame, StoreError>)> = keys
            .into_par_iter()
            .map(|key| {
                let read = self.store.read(&key);
                (key, read)
            })
            .collect();

        let mut frames = Vec::new();
        let mut skipped = Vec::new();
        for (key, read) in results {
            match read {
                Ok(df) => frames.push(df.lazy()),
                Err(e) => {
                    warn!(partition = %key, error = %e, "skipping unreadable partition");
                    skipped.push(SkippedPartition {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if frames.is_empty() {
            return Err(StoreError::NoPartitions);
        }
        let read = frames.len();
        let lf = concat(frames, UnionArgs::default())?;
        Ok((lf, read, skipped))
    }
}
