//! Vision Core — download engine for the Binance public data repository.
//!
//! - Job configuration and logging setup
//! - Task planning over (data kind, symbol, interval, date)
//! - Resume index that inspects local files before any network access
//! - Rate-limited worker pool with per-task retry and failure isolation
//! - Archive extraction and optional checksum verification

pub mod checksum;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod layout;
pub mod logging;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod rate_gate;
pub mod resume;
pub mod retry;

pub use config::{ConfigError, VaultConfig};
pub use domain::{DataKind, DownloadTask, Interval, TaskId, TaskOutcome, TaskStatus};
pub use error::TaskError;
pub use fetch::{ArchiveFetcher, HttpFetcher};
pub use layout::StorageLayout;
pub use pool::{DownloadPool, PoolSettings, RunSummary};
