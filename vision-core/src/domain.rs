//! Domain types: data kinds, kline intervals, task identities and outcomes.

use crate::error::TaskError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// A name that does not map to any known data kind or interval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} '{name}'")]
pub struct ParseNameError {
    pub what: &'static str,
    pub name: String,
}

/// Upstream data types published as daily archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    Klines,
    IndexPriceKlines,
    MarkPriceKlines,
    PremiumIndexKlines,
    AggTrades,
    Trades,
    BookTicker,
    BookDepth,
    Metrics,
}

impl DataKind {
    pub const ALL: [DataKind; 9] = [
        DataKind::Klines,
        DataKind::IndexPriceKlines,
        DataKind::MarkPriceKlines,
        DataKind::PremiumIndexKlines,
        DataKind::AggTrades,
        DataKind::Trades,
        DataKind::BookTicker,
        DataKind::BookDepth,
        DataKind::Metrics,
    ];

    /// Upstream path segment, e.g. `markPriceKlines`.
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Klines => "klines",
            DataKind::IndexPriceKlines => "indexPriceKlines",
            DataKind::MarkPriceKlines => "markPriceKlines",
            DataKind::PremiumIndexKlines => "premiumIndexKlines",
            DataKind::AggTrades => "aggTrades",
            DataKind::Trades => "trades",
            DataKind::BookTicker => "bookTicker",
            DataKind::BookDepth => "bookDepth",
            DataKind::Metrics => "metrics",
        }
    }

    /// Kline-family kinds are published once per interval.
    pub fn has_interval(self) -> bool {
        matches!(
            self,
            DataKind::Klines
                | DataKind::IndexPriceKlines
                | DataKind::MarkPriceKlines
                | DataKind::PremiumIndexKlines
        )
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseNameError {
                what: "data type",
                name: s.to_string(),
            })
    }
}

/// Kline intervals available as daily archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
        }
    }

    /// Bar length in milliseconds.
    pub fn millis(self) -> i64 {
        const MIN: i64 = 60_000;
        match self {
            Interval::M1 => MIN,
            Interval::M3 => 3 * MIN,
            Interval::M5 => 5 * MIN,
            Interval::M15 => 15 * MIN,
            Interval::M30 => 30 * MIN,
            Interval::H1 => 60 * MIN,
            Interval::H2 => 120 * MIN,
            Interval::H4 => 240 * MIN,
            Interval::H6 => 360 * MIN,
            Interval::H8 => 480 * MIN,
            Interval::H12 => 720 * MIN,
            Interval::D1 => 1440 * MIN,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| ParseNameError {
                what: "kline interval",
                name: s.to_string(),
            })
    }
}

/// Identity of one upstream daily archive.
///
/// Ordering is (kind, symbol, interval, date) so a sorted task list groups
/// each symbol's files together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub kind: DataKind,
    pub symbol: String,
    pub interval: Option<Interval>,
    pub date: NaiveDate,
}

impl TaskId {
    pub fn new(
        kind: DataKind,
        symbol: impl Into<String>,
        interval: Option<Interval>,
        date: NaiveDate,
    ) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            interval,
            date,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(iv) => write!(f, "{}/{}/{}/{}", self.kind, self.symbol, iv, self.date),
            None => write!(f, "{}/{}/{}", self.kind, self.symbol, self.date),
        }
    }
}

/// A fully-addressed download: where to fetch from and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: TaskId,
    pub url: String,
    pub checksum_url: String,
    pub archive_path: PathBuf,
    pub csv_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Skipped,
    Failed,
}

/// What happened to one task during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub bytes: Option<u64>,
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    pub fn completed(id: TaskId, attempts: u32, bytes: Option<u64>) -> Self {
        Self {
            id,
            status: TaskStatus::Completed,
            attempts,
            bytes,
            error: None,
        }
    }

    pub fn skipped(id: TaskId) -> Self {
        Self {
            id,
            status: TaskStatus::Skipped,
            attempts: 0,
            bytes: None,
            error: None,
        }
    }

    pub fn failed(id: TaskId, attempts: u32, error: TaskError) -> Self {
        Self {
            id,
            status: TaskStatus::Failed,
            attempts,
            bytes: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in DataKind::ALL {
            assert_eq!(kind.as_str().parse::<DataKind>().unwrap(), kind);
        }
        assert!("fundingRate".parse::<DataKind>().is_err());
    }

    #[test]
    fn only_kline_family_has_intervals() {
        assert!(DataKind::Klines.has_interval());
        assert!(DataKind::PremiumIndexKlines.has_interval());
        assert!(!DataKind::AggTrades.has_interval());
        assert!(!DataKind::Metrics.has_interval());
    }

    #[test]
    fn interval_names_and_lengths() {
        assert_eq!("4h".parse::<Interval>().unwrap(), Interval::H4);
        assert_eq!(Interval::D1.millis(), 86_400_000);
        assert!("1w".parse::<Interval>().is_err());
    }

    #[test]
    fn serde_names_match_upstream() {
        assert_eq!(
            serde_json::to_string(&DataKind::IndexPriceKlines).unwrap(),
            "\"indexPriceKlines\""
        );
        assert_eq!(serde_json::to_string(&Interval::M15).unwrap(), "\"15m\"");
    }

    #[test]
    fn task_id_display() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let kline = TaskId::new(DataKind::Klines, "BTCUSDT", Some(Interval::D1), date);
        assert_eq!(kline.to_string(), "klines/BTCUSDT/1d/2025-01-01");
        let trades = TaskId::new(DataKind::AggTrades, "BTCUSDT", None, date);
        assert_eq!(trades.to_string(), "aggTrades/BTCUSDT/2025-01-01");
    }
}
