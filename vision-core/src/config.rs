//! TOML job configuration.
//!
//! A fixed set of options; every table rejects unknown keys so a typo fails
//! at startup instead of being silently ignored. [`VaultConfig::from_file`]
//! parses and validates in one step.

use crate::domain::{DataKind, Interval};
use crate::layout::{StorageLayout, DEFAULT_BASE_URL};
use crate::planner::PlanInput;
use crate::pool::PoolSettings;
use crate::rate_gate::RateGate;
use crate::retry::{Backoff, RetryPolicy};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every delay and timeout option, in seconds.
pub const MAX_SECONDS: f64 = 3600.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_store_directory")]
    pub store_directory: PathBuf,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    pub time_range: TimeRange,
    pub data_types: DataTypeToggles,
    #[serde(default)]
    pub kline_intervals: Vec<String>,
    /// Empty means "every tradable pair", resolved by the caller.
    #[serde(default)]
    pub trading_pairs: Vec<String>,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub file_processing: FileProcessing,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    pub start_date: String,
    /// `YYYY-MM-DD` or `latest` (today, UTC).
    pub end_date: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataTypeToggles {
    #[serde(default)]
    pub klines: bool,
    #[serde(default, rename = "indexPriceKlines")]
    pub index_price_klines: bool,
    #[serde(default, rename = "markPriceKlines")]
    pub mark_price_klines: bool,
    #[serde(default, rename = "premiumIndexKlines")]
    pub premium_index_klines: bool,
    #[serde(default, rename = "aggTrades")]
    pub agg_trades: bool,
    #[serde(default)]
    pub trades: bool,
    #[serde(default, rename = "bookTicker")]
    pub book_ticker: bool,
    #[serde(default, rename = "bookDepth")]
    pub book_depth: bool,
    #[serde(default)]
    pub metrics: bool,
}

impl DataTypeToggles {
    pub fn enabled(&self) -> Vec<DataKind> {
        [
            (self.klines, DataKind::Klines),
            (self.index_price_klines, DataKind::IndexPriceKlines),
            (self.mark_price_klines, DataKind::MarkPriceKlines),
            (self.premium_index_klines, DataKind::PremiumIndexKlines),
            (self.agg_trades, DataKind::AggTrades),
            (self.trades, DataKind::Trades),
            (self.book_ticker, DataKind::BookTicker),
            (self.book_depth, DataKind::BookDepth),
            (self.metrics, DataKind::Metrics),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DownloadSettings {
    pub max_concurrent_downloads: usize,
    pub retry_attempts: u32,
    /// Seconds between attempts (base delay for exponential backoff).
    pub retry_delay: f64,
    /// Minimum seconds between any two requests, across all workers.
    pub rate_limit_delay: f64,
    pub backoff: BackoffKind,
    /// Cap for exponential backoff, seconds.
    pub max_retry_delay: f64,
    /// Per-request timeout, seconds.
    pub request_timeout: f64,
    pub verify_checksum: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            retry_attempts: 3,
            retry_delay: 5.0,
            rate_limit_delay: 0.1,
            backoff: BackoffKind::Fixed,
            max_retry_delay: 60.0,
            request_timeout: 30.0,
            verify_checksum: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileProcessing {
    pub auto_extract: bool,
    pub delete_zip_after_extract: bool,
    pub overwrite_existing: bool,
}

impl Default for FileProcessing {
    fn default() -> Self {
        Self {
            auto_extract: true,
            delete_zip_after_extract: true,
            overwrite_existing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console_output: true,
            file_output: true,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

impl VaultConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate(chrono::Utc::now().date_naive())?;
        Ok(config)
    }

    /// Check every option against its allowed range.
    pub fn validate(&self, today: NaiveDate) -> Result<(), ConfigError> {
        let d = &self.download;
        if !(1..=64).contains(&d.max_concurrent_downloads) {
            return Err(invalid(format!(
                "download.max_concurrent_downloads must be 1..=64, got {}",
                d.max_concurrent_downloads
            )));
        }
        if !(1..=20).contains(&d.retry_attempts) {
            return Err(invalid(format!(
                "download.retry_attempts must be 1..=20, got {}",
                d.retry_attempts
            )));
        }
        for (name, secs) in [
            ("retry_delay", d.retry_delay),
            ("rate_limit_delay", d.rate_limit_delay),
            ("max_retry_delay", d.max_retry_delay),
        ] {
            if !(0.0..=MAX_SECONDS).contains(&secs) {
                return Err(invalid(format!(
                    "download.{name} must be 0..={MAX_SECONDS} seconds, got {secs}"
                )));
            }
        }
        if !(d.request_timeout > 0.0 && d.request_timeout <= MAX_SECONDS) {
            return Err(invalid(format!(
                "download.request_timeout must be in (0, {MAX_SECONDS}] seconds, got {}",
                d.request_timeout
            )));
        }

        if self.data_types.enabled().is_empty() {
            return Err(invalid("no data types enabled".into()));
        }
        self.intervals()?;
        self.symbols()?;
        let (start, end) = self.resolve_dates(today)?;
        if start > end {
            return Err(invalid(format!("start_date {start} is after end_date {end}")));
        }
        Ok(())
    }

    pub fn resolve_dates(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate), ConfigError> {
        let parse = |field: &str, value: &str| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map_err(|e| invalid(format!("time_range.{field} '{value}': {e}")))
        };
        let start = parse("start_date", &self.time_range.start_date)?;
        let end = if self.time_range.end_date.eq_ignore_ascii_case("latest") {
            today
        } else {
            parse("end_date", &self.time_range.end_date)?
        };
        Ok((start, end))
    }

    pub fn intervals(&self) -> Result<Vec<Interval>, ConfigError> {
        self.kline_intervals
            .iter()
            .map(|s| s.parse::<Interval>().map_err(|e| invalid(e.to_string())))
            .collect()
    }

    /// Configured symbols, upper-cased. Only `[A-Z0-9_]` is accepted since
    /// symbols become path segments.
    pub fn symbols(&self) -> Result<Vec<String>, ConfigError> {
        self.trading_pairs
            .iter()
            .map(|s| {
                let sym = s.trim().to_ascii_uppercase();
                if sym.is_empty() || !sym.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    Err(invalid(format!("invalid trading pair '{s}'")))
                } else {
                    Ok(sym)
                }
            })
            .collect()
    }

    /// Planner input using the configured symbols.
    pub fn plan_input(&self, today: NaiveDate) -> Result<PlanInput, ConfigError> {
        let (start, end) = self.resolve_dates(today)?;
        Ok(PlanInput {
            start,
            end,
            kinds: self.data_types.enabled(),
            intervals: self.intervals()?,
            symbols: self.symbols()?,
        })
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.base_url.clone(), self.output_directory.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let d = &self.download;
        let backoff = match d.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max_delay: seconds(d.max_retry_delay),
                jitter_pct: 0.2,
            },
        };
        RetryPolicy::new(d.retry_attempts, seconds(d.retry_delay), backoff)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrency: self.download.max_concurrent_downloads,
            retry: self.retry_policy(),
            auto_extract: self.file_processing.auto_extract,
            delete_archive: self.file_processing.delete_zip_after_extract,
            overwrite_existing: self.file_processing.overwrite_existing,
            verify_checksum: self.download.verify_checksum,
        }
    }

    pub fn rate_gate(&self) -> RateGate {
        RateGate::new(seconds(self.download.rate_limit_delay))
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.download.request_timeout)
    }
}

/// Saturating conversion; out-of-range values never reach here after `validate`.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        trading_pairs = ["BTCUSDT"]
        kline_intervals = ["1d"]

        [time_range]
        start_date = "2025-01-01"
        end_date = "2025-01-02"

        [data_types]
        klines = true
    "#;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let config = VaultConfig::from_toml(include_str!("../../config.example.toml")).unwrap();
        assert_eq!(config.intervals().unwrap(), vec![Interval::H1, Interval::D1]);
        assert_eq!(config.resolve_dates(today()).unwrap().1, today());
    }

    #[test]
    fn example_config_parses_with_defaults() {
        let config = VaultConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.download.retry_attempts, 3);
        assert!(config.file_processing.auto_extract);
        assert_eq!(config.data_types.enabled(), vec![DataKind::Klines]);

        let input = config.plan_input(today()).unwrap();
        assert_eq!(input.intervals, vec![Interval::D1]);
        assert_eq!(input.symbols, vec!["BTCUSDT"]);
        assert_eq!(input.end, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let top = format!("{EXAMPLE}\nbogus = 1\n");
        assert!(matches!(VaultConfig::from_toml(&top), Err(ConfigError::Parse(_))));

        let kind = EXAMPLE.replace("klines = true", "klines = true\nfundingRate = true");
        assert!(matches!(VaultConfig::from_toml(&kind), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn unknown_interval_is_invalid() {
        let bad = EXAMPLE.replace("[\"1d\"]", "[\"7d\"]");
        assert!(matches!(VaultConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn out_of_range_settings_are_invalid() {
        let zero_workers = format!("{EXAMPLE}\n[download]\nmax_concurrent_downloads = 0\n");
        assert!(matches!(
            VaultConfig::from_toml(&zero_workers),
            Err(ConfigError::Invalid(_))
        ));
        let negative = format!("{EXAMPLE}\n[download]\nrate_limit_delay = -1.0\n");
        assert!(matches!(
            VaultConfig::from_toml(&negative),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn huge_delays_are_invalid_not_a_panic() {
        for (key, value) in [
            ("retry_delay", "1e20"),
            ("rate_limit_delay", "3601.0"),
            ("max_retry_delay", "1e300"),
            ("request_timeout", "1e20"),
            ("retry_delay", "nan"),
        ] {
            let toml = format!("{EXAMPLE}\n[download]\n{key} = {value}\n");
            assert!(
                matches!(VaultConfig::from_toml(&toml), Err(ConfigError::Invalid(_))),
                "{key} = {value} should be rejected"
            );
        }

        let mut config: VaultConfig = toml::from_str(EXAMPLE).unwrap();
        config.download.retry_delay = 1e20;
        config.download.request_timeout = -1.0;
        let settings = config.pool_settings();
        assert_eq!(settings.retry.base_delay, Duration::MAX);
        assert_eq!(config.request_timeout(), Duration::ZERO);
    }

    #[test]
    fn inverted_dates_are_invalid() {
        let bad = EXAMPLE.replace("2025-01-02", "2024-12-31");
        assert!(matches!(VaultConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn latest_resolves_to_today() {
        let mut config: VaultConfig = toml::from_str(EXAMPLE).unwrap();
        config.time_range.end_date = "latest".into();
        let (_, end) = config.resolve_dates(today()).unwrap();
        assert_eq!(end, today());
    }

    #[test]
    fn symbols_are_normalised_and_checked() {
        let mut config: VaultConfig = toml::from_str(EXAMPLE).unwrap();
        config.trading_pairs = vec![" ethusdt ".into()];
        assert_eq!(config.symbols().unwrap(), vec!["ETHUSDT"]);
        config.trading_pairs = vec!["../etc".into()];
        assert!(config.symbols().is_err());
    }

    #[test]
    fn settings_flow_into_pool() {
        let config = VaultConfig::from_toml(&format!(
            "{EXAMPLE}\n[download]\nretry_attempts = 5\nbackoff = \"exponential\"\n"
        ))
        .unwrap();
        let settings = config.pool_settings();
        assert_eq!(settings.retry.max_attempts, 5);
        assert!(matches!(settings.retry.backoff, Backoff::Exponential { .. }));
        assert_eq!(config.rate_gate().min_spacing(), Duration::from_millis(100));
    }
}
