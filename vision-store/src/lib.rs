//! Vision Store — partitioned Parquet store for downloaded market data.
//!
//! - Fixed upstream CSV schemas and their stored Parquet shape
//! - CSV ingest with timestamp normalisation, day bucketing and dedupe
//! - Hive-style partition store with atomic writes and metadata sidecars
//! - Parallel, re-runnable ETL from the raw tree
//! - Cleanup of partial and orphaned files
//! - Partition-pruned scans and per-symbol aggregates

pub mod cleanup;
pub mod error;
pub mod ingest;
pub mod partition;
pub mod perf;
pub mod query;
pub mod schema;
pub mod transform;

pub use error::StoreError;
pub use partition::{PartitionKey, PartitionStore, LAYOUT_VERSION};
pub use query::{covering_keys, QueryEngine, QueryResult, QuerySpec};
pub use transform::{EtlMode, EtlTransformer, TransformReport};
