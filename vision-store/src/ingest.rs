//! Raw CSV → normalised DataFrame for a single partition.
//!
//! Parsing is strict: any row that does not fit the kind's fixed schema makes
//! the whole source an integrity failure, so a partition is either built
//! from every row of its source or not at all.

use crate::error::StoreError;
use crate::partition::PartitionKey;
use crate::schema::{ColumnType, KindSchema, SYMBOL_COLUMN};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use polars::prelude::*;
use std::collections::HashSet;
use std::path::Path;

pub const DAY_MS: i64 = 86_400_000;

/// Values above this are microseconds, not milliseconds (year ~5138 in ms).
const MICROS_THRESHOLD: i64 = 100_000_000_000_000;
/// Values above this are nanoseconds.
const NANOS_THRESHOLD: i64 = 100_000_000_000_000_000;

/// Result of ingesting one source.
#[derive(Debug)]
pub struct Ingested {
    pub frame: DataFrame,
    pub rows_read: usize,
    /// Rows whose time fell outside the partition's UTC day.
    pub out_of_day: usize,
    pub duplicates: usize,
    pub min_time: i64,
    pub max_time: i64,
}

/// UTC `[start, end)` bounds of a day in epoch milliseconds.
pub fn day_bounds(date: NaiveDate) -> (i64, i64) {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    (start, start + DAY_MS)
}

/// Normalise a timestamp field to epoch milliseconds.
///
/// Accepts integer or float epochs in ms, µs or ns, and
/// `YYYY-MM-DD HH:MM:SS[.fff]` strings interpreted as UTC.
pub fn parse_time(field: &str) -> Option<i64> {
    if let Ok(v) = field.parse::<i64>() {
        return Some(scale_epoch(v));
    }
    if let Ok(v) = field.parse::<f64>() {
        return v.is_finite().then(|| scale_epoch(v as i64));
    }
    NaiveDateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn scale_epoch(v: i64) -> i64 {
    if v.abs() >= NANOS_THRESHOLD {
        v / 1_000_000
    } else if v.abs() >= MICROS_THRESHOLD {
        v / 1_000
    } else {
        v
    }
}

fn parse_bool(field: &str) -> Option<bool> {
    match field {
        "1" => Some(true),
        "0" => Some(false),
        f if f.eq_ignore_ascii_case("true") => Some(true),
        f if f.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

enum ColumnBuf {
    Int(Vec<i64>),
    Float(Vec<Option<f64>>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl ColumnBuf {
    fn for_type(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Time | ColumnType::Int => ColumnBuf::Int(Vec::new()),
            ColumnType::Float => ColumnBuf::Float(Vec::new()),
            ColumnType::Bool => ColumnBuf::Bool(Vec::new()),
            ColumnType::Str => ColumnBuf::Str(Vec::new()),
        }
    }

    /// Parse and append one field; `false` when the field does not fit.
    fn push(&mut self, ty: ColumnType, field: &str) -> bool {
        match (self, ty) {
            (ColumnBuf::Int(v), ColumnType::Time) => parse_time(field).map(|t| v.push(t)).is_some(),
            (ColumnBuf::Int(v), _) => field
                .parse::<i64>()
                .ok()
                .or_else(|| field.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(|i| v.push(i))
                .is_some(),
            (ColumnBuf::Float(v), _) if field.is_empty() => {
                v.push(None);
                true
            }
            (ColumnBuf::Float(v), _) => field.parse::<f64>().ok().map(|f| v.push(Some(f))).is_some(),
            (ColumnBuf::Bool(v), _) => parse_bool(field).map(|b| v.push(b)).is_some(),
            (ColumnBuf::Str(v), _) => {
                v.push(field.to_string());
                true
            }
        }
    }

    fn key_part(&self, row: usize) -> i64 {
        match self {
            ColumnBuf::Int(v) => v[row],
            ColumnBuf::Float(v) => v[row].map_or(i64::MIN, |f| f.to_bits() as i64),
            ColumnBuf::Bool(v) => v[row] as i64,
            ColumnBuf::Str(_) => 0,
        }
    }

    fn gather(&self, name: &str, rows: &[usize]) -> Column {
        match self {
            ColumnBuf::Int(v) => Column::new(name.into(), rows.iter().map(|&i| v[i]).collect::<Vec<i64>>()),
            ColumnBuf::Float(v) => Column::new(
                name.into(),
                rows.iter().map(|&i| v[i]).collect::<Vec<Option<f64>>>(),
            ),
            ColumnBuf::Bool(v) => Column::new(name.into(), rows.iter().map(|&i| v[i]).collect::<Vec<bool>>()),
            ColumnBuf::Str(v) => Column::new(
                name.into(),
                rows.iter().map(|&i| v[i].clone()).collect::<Vec<String>>(),
            ),
        }
    }
}

/// Parses upstream CSV files for one data kind.
pub struct CsvIngestor {
    schema: KindSchema,
}

impl CsvIngestor {
    pub fn new(schema: KindSchema) -> Self {
        Self { schema }
    }

    /// Parse `bytes` as the CSV for `key`. `origin` only labels errors.
    pub fn ingest_bytes(
        &self,
        bytes: &[u8],
        key: &PartitionKey,
        origin: &Path,
    ) -> Result<Ingested, StoreError> {
        let columns = self.schema.columns;
        let mut bufs: Vec<ColumnBuf> = columns.iter().map(|c| ColumnBuf::for_type(c.ty)).collect();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let mut rows_read = 0usize;
        let mut first = true;
        for (line, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| StoreError::integrity(origin, format!("line {}: {e}", line + 1)))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            // header detection: the first line is a header when its first field
            // does not parse as the first column's type
            if std::mem::take(&mut first) && is_header(&record, columns[0].ty) {
                continue;
            }
            if record.len() != columns.len() {
                return Err(StoreError::integrity(
                    origin,
                    format!(
                        "line {}: expected {} fields, found {}",
                        line + 1,
                        columns.len(),
                        record.len()
                    ),
                ));
            }
            for ((buf, col), field) in bufs.iter_mut().zip(columns).zip(record.iter()) {
                if !buf.push(col.ty, field) {
                    return Err(StoreError::integrity(
                        origin,
                        format!("line {}: bad value '{field}' for column {}", line + 1, col.name),
                    ));
                }
            }
            rows_read += 1;
        }

        if rows_read == 0 {
            return Err(StoreError::integrity(origin, "source has no data rows"));
        }

        let time_idx = self.column_index(self.schema.time_column)?;
        let key_idx: Vec<usize> = self
            .schema
            .key_columns
            .iter()
            .map(|k| self.column_index(k))
            .collect::<Result<_, _>>()?;
        let ColumnBuf::Int(times) = &bufs[time_idx] else {
            return Err(StoreError::integrity(origin, "time column is not integral"));
        };

        let (day_start, day_end) = day_bounds(key.date);
        let in_day: Vec<usize> = (0..rows_read)
            .filter(|&i| times[i] >= day_start && times[i] < day_end)
            .collect();
        let out_of_day = rows_read - in_day.len();

        let mut seen = HashSet::with_capacity(in_day.len());
        let mut rows: Vec<usize> = in_day
            .into_iter()
            .filter(|&i| seen.insert(key_idx.iter().map(|&k| bufs[k].key_part(i)).collect::<Vec<i64>>()))
            .collect();
        let duplicates = rows_read - out_of_day - rows.len();

        if rows.is_empty() {
            return Err(StoreError::integrity(
                origin,
                format!("no rows fall on {}", key.date),
            ));
        }

        rows.sort_by_cached_key(|&i| {
            (
                times[i],
                key_idx.iter().map(|&k| bufs[k].key_part(i)).collect::<Vec<i64>>(),
            )
        });
        let min_time = times[rows[0]];
        let max_time = times[rows[rows.len() - 1]];

        let mut frame_columns: Vec<Column> = columns
            .iter()
            .zip(&bufs)
            .map(|(col, buf)| buf.gather(col.name, &rows))
            .collect();
        if !self.schema.has_symbol_column() {
            frame_columns.push(Column::new(
                SYMBOL_COLUMN.into(),
                vec![key.symbol.as_str(); rows.len()],
            ));
        }
        let frame = DataFrame::new(frame_columns)?;

        Ok(Ingested {
            frame,
            rows_read,
            out_of_day,
            duplicates,
            min_time,
            max_time,
        })
    }

    fn column_index(&self, name: &str) -> Result<usize, StoreError> {
        self.schema
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| StoreError::Parquet(format!("schema has no column {name}")))
    }
}

fn is_header(record: &csv::StringRecord, first: ColumnType) -> bool {
    let Some(field) = record.get(0) else {
        return false;
    };
    match first {
        ColumnType::Time => parse_time(field).is_none(),
        ColumnType::Int | ColumnType::Float => field.parse::<f64>().is_err(),
        ColumnType::Bool => parse_bool(field).is_none(),
        ColumnType::Str => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vision_core::{DataKind, Interval};

    fn key(kind: DataKind, interval: Option<Interval>) -> PartitionKey {
        PartitionKey {
            kind,
            interval,
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            symbol: "BTCUSDT".into(),
        }
    }

    fn ingest(kind: DataKind, csv: &str) -> Result<Ingested, StoreError> {
        let interval = kind.has_interval().then_some(Interval::D1);
        CsvIngestor::new(KindSchema::for_kind(kind)).ingest_bytes(
            csv.as_bytes(),
            &key(kind, interval),
            Path::new("test.csv"),
        )
    }

    #[test]
    fn times_normalise_to_millis() {
        assert_eq!(parse_time("1735689600000"), Some(1_735_689_600_000));
        assert_eq!(parse_time("1735689600000000"), Some(1_735_689_600_000));
        assert_eq!(parse_time("1735689600000000000"), Some(1_735_689_600_000));
        assert_eq!(parse_time("2025-01-01 00:00:08"), Some(1_735_689_608_000));
        assert_eq!(parse_time("not a time"), None);
    }

    #[test]
    fn day_bounds_are_utc() {
        let (start, end) = day_bounds(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(start, 1_735_689_600_000);
        assert_eq!(end - start, DAY_MS);
    }

    #[test]
    fn klines_with_and_without_header_parse_identically() {
        let body = "1735689600000,1,2,0.5,1.5,10,1735775999999,15,3,4,6,0\n";
        let header = "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore\n";
        let a = ingest(DataKind::Klines, body).unwrap();
        let b = ingest(DataKind::Klines, &format!("{header}{body}")).unwrap();
        assert!(a.frame.equals(&b.frame));
        assert_eq!(a.frame.width(), 13);
        assert_eq!(
            a.frame.column("symbol").unwrap().str().unwrap().get(0),
            Some("BTCUSDT")
        );
    }

    #[test]
    fn rows_outside_the_day_are_dropped_and_duplicates_collapsed() {
        let csv = "\
id,price,qty,quote_qty,time,is_buyer_maker
3,100,1,100,1735689600300,true
1,100,1,100,1735689600100,false
1,100,1,100,1735689600100,false
2,100,1,100,1735776000000,true
";
        let out = ingest(DataKind::Trades, csv).unwrap();
        assert_eq!(out.rows_read, 4);
        assert_eq!(out.out_of_day, 1);
        assert_eq!(out.duplicates, 1);
        assert_eq!(out.frame.height(), 2);
        let ids: Vec<Option<i64>> = out.frame.column("id").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(ids, vec![Some(1), Some(3)]);
        assert_eq!((out.min_time, out.max_time), (1_735_689_600_100, 1_735_689_600_300));
    }

    #[test]
    fn book_depth_string_timestamps_and_composite_key() {
        let csv = "\
timestamp,percentage,depth,notional
2025-01-01 00:00:08,-1.00,100.5,1000.0
2025-01-01 00:00:08,1.00,90.0,900.0
2025-01-01 00:00:08,-1.00,100.5,1000.0
";
        let out = ingest(DataKind::BookDepth, csv).unwrap();
        assert_eq!(out.frame.height(), 2);
        assert_eq!(out.duplicates, 1);
    }

    #[test]
    fn metrics_keep_their_own_symbol_column() {
        let csv = "\
create_time,symbol,sum_open_interest,sum_open_interest_value,count_toptrader_long_short_ratio,sum_toptrader_long_short_ratio,count_long_short_ratio,sum_taker_long_short_vol_ratio
2025-01-01 00:05:00,BTCUSDT,80000.1,7.5e9,1.2,1.1,1.3,
";
        let out = ingest(DataKind::Metrics, csv).unwrap();
        assert_eq!(out.frame.width(), 8);
        assert_eq!(out.frame.column("sum_taker_long_short_vol_ratio").unwrap().null_count(), 1);
    }

    #[test]
    fn malformed_rows_fail_the_source() {
        let short = "1735689600000,1,2\n";
        assert!(matches!(
            ingest(DataKind::Klines, short),
            Err(StoreError::Integrity { .. })
        ));
        let bad_value = "1,abc,1,100,1735689600100,false\n";
        assert!(matches!(
            ingest(DataKind::Trades, bad_value),
            Err(StoreError::Integrity { .. })
        ));
        assert!(matches!(
            ingest(DataKind::Trades, "id,price,qty,quote_qty,time,is_buyer_maker\n"),
            Err(StoreError::Integrity { .. })
        ));
    }
}
