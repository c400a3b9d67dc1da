//! Network access: the fetcher trait the pool drives, and its HTTP implementation.
//!
//! The pool only sees [`ArchiveFetcher`], so tests swap in an in-memory
//! fetcher and never touch the network.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::TaskError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// USD-M futures exchange metadata, used to list every tradable pair.
pub const FUTURES_EXCHANGE_INFO_URL: &str = "https://fapi.binance.com/fapi/v1/exchangeInfo";

const USER_AGENT: &str = concat!("vision-vault/", env!("CARGO_PKG_VERSION"));

pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// Implementations must never leave a partial body at `dest`.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TaskError>;

    /// Fetch a small text resource (checksum sidecars).
    fn fetch_text(&self, url: &str) -> Result<String, TaskError>;
}

/// Blocking HTTP fetcher guarded by a shared circuit breaker.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    breaker: Arc<CircuitBreaker>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, breaker: Arc<CircuitBreaker>) -> Result<Self, TaskError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TaskError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, breaker })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, TaskError> {
        if !self.breaker.is_allowed() {
            return Err(TaskError::CircuitOpen);
        }
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| TaskError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            self.breaker.record_success();
            return Ok(resp);
        }
        match status {
            StatusCode::NOT_FOUND => Err(TaskError::NotFound {
                url: url.to_string(),
            }),
            StatusCode::FORBIDDEN => {
                self.breaker.trip();
                Err(TaskError::CircuitOpen)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.breaker.record_throttle();
                Err(TaskError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
            _ => Err(TaskError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// All TRADING perpetual USDT-quoted symbols, sorted.
    pub fn fetch_trading_pairs(&self) -> Result<Vec<String>, TaskError> {
        let info: ExchangeInfo = self
            .get(FUTURES_EXCHANGE_INFO_URL)?
            .json()
            .map_err(|e| TaskError::Integrity(format!("unexpected exchangeInfo payload: {e}")))?;
        Ok(info.perpetual_usdt_symbols())
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TaskError> {
        let mut resp = self.get(url)?;
        let part = part_path(dest);
        let written = (|| -> io::Result<u64> {
            let mut out = BufWriter::new(File::create(&part)?);
            let n = io::copy(&mut resp, &mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
            Ok(n)
        })();

        match written {
            Ok(n) => {
                fs::rename(&part, dest).map_err(|e| {
                    let _ = fs::remove_file(&part);
                    TaskError::Io(format!("atomic rename failed: {e}"))
                })?;
                debug!(url, bytes = n, "download finished");
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                // body read failures are connection drops, worth retrying
                Err(TaskError::Network(format!("body transfer failed: {e}")))
            }
        }
    }

    fn fetch_text(&self, url: &str) -> Result<String, TaskError> {
        self.get(url)?
            .text()
            .map_err(|e| TaskError::Network(e.to_string()))
    }
}

/// In-progress download name next to `dest`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    contract_type: String,
    quote_asset: String,
}

impl ExchangeInfo {
    fn perpetual_usdt_symbols(self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.contract_type == "PERPETUAL" && s.quote_asset == "USDT")
            .map(|s| s.symbol)
            .collect();
        symbols.sort();
        symbols
    }
}
