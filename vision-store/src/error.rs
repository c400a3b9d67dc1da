use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("integrity error in {path}: {reason}")]
    Integrity { path: String, reason: String },

    #[error("partial write to {path}: {reason}")]
    PartialWrite { path: String, reason: String },

    #[error("store layout version {found} is not supported (expected {expected}); migrate the store first")]
    LayoutVersion { found: u32, expected: u32 },

    #[error("no partitions cover the query")]
    NoPartitions,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("raw tree error: {0}")]
    Raw(String),
}

impl StoreError {
    pub fn integrity(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl From<polars::prelude::PolarsError> for StoreError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        StoreError::Parquet(e.to_string())
    }
}
