//! Per-task error types for the download engine.
//!
//! Every failure a single task can hit (network, HTTP status, checksum,
//! corrupt archive, local I/O) is folded into [`TaskError`] so the
//! downloader and the extractor report through one channel and the retry
//! state machine can decide what is worth another attempt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TaskError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("data not available (404): {url}")]
    NotFound { url: String },

    #[error("hard stop: upstream has blocked requests (circuit breaker open)")]
    CircuitOpen,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("an identical task was already in flight")]
    InFlight,
}

impl TaskError {
    /// Whether another attempt at the same task could succeed.
    ///
    /// 404 means the upstream never published the file, and an open circuit
    /// breaker means every request is refused, so neither is retried. Local
    /// I/O errors (disk full, permissions) will not fix themselves either.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Network(_) => true,
            TaskError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            TaskError::ChecksumMismatch { .. } | TaskError::Integrity(_) | TaskError::InFlight => {
                true
            }
            TaskError::NotFound { .. } | TaskError::CircuitOpen | TaskError::Io(_) => false,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(e.to_string())
    }
}
