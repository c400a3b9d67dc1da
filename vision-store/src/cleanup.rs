//! Maintenance pass over the store and the raw tree.
//!
//! Removes what a crash or an interrupted run can leave behind: temp files,
//! zero-byte or truncated Parquet units and sidecars without a partition.
//! Partitions whose raw source is gone are only removed on request, since
//! deleting raw CSVs after ETL is a normal way to save space.

use crate::error::StoreError;
use crate::partition::{walk_dir, PartitionStore};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vision_core::resume::{FileState, ResumeIndex};
use vision_core::StorageLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    ZeroByte,
    Corrupt(String),
    TempLeftover,
    OrphanPartition,
    OrphanSidecar,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::ZeroByte => write!(f, "zero-byte file"),
            CleanupReason::Corrupt(reason) => write!(f, "corrupt: {reason}"),
            CleanupReason::TempLeftover => write!(f, "leftover temp file"),
            CleanupReason::OrphanPartition => write!(f, "source CSV no longer present"),
            CleanupReason::OrphanSidecar => write!(f, "sidecar without partition"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Report only; delete nothing.
    pub dry_run: bool,
    /// Also remove partitions whose raw CSV is gone.
    pub remove_orphans: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupEntry {
    pub path: PathBuf,
    pub reason: CleanupReason,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub entries: Vec<CleanupEntry>,
    /// Deletions that failed, with the error.
    pub errors: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}

pub struct Cleaner<'a> {
    store: &'a PartitionStore,
    layout: &'a StorageLayout,
    index: ResumeIndex,
}

impl<'a> Cleaner<'a> {
    pub fn new(store: &'a PartitionStore, layout: &'a StorageLayout) -> Self {
        Self {
            store,
            layout,
            index: ResumeIndex::new(),
        }
    }

    /// Find everything that should go, without touching the filesystem.
    pub fn scan(&self, options: CleanupOptions) -> Result<Vec<CleanupEntry>, StoreError> {
        let mut entries = Vec::new();
        let files = self.store.walk_files()?;

        for path in &files {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(".tmp") {
                entries.push(entry(path, CleanupReason::TempLeftover));
                continue;
            }
            if let Some(key) = self.store.parse_parquet_path(path) {
                match self.index.inspect(path) {
                    FileState::PresentInvalid(reason) => {
                        let reason = if file_len(path) == 0 {
                            CleanupReason::ZeroByte
                        } else {
                            CleanupReason::Corrupt(reason)
                        };
                        entries.push(entry(path, reason));
                        push_sidecar(&mut entries, &self.store.meta_path(&key));
                    }
                    FileState::PresentValid
                        if options.remove_orphans
                            && !self.layout.csv_path(&key.task_id()).exists() =>
                    {
                        entries.push(entry(path, CleanupReason::OrphanPartition));
                        push_sidecar(&mut entries, &self.store.meta_path(&key));
                    }
                    _ => {}
                }
                continue;
            }
            if let Some(parquet) = name
                .strip_suffix(".meta.json")
                .map(|stem| path.with_file_name(format!("{stem}.parquet")))
            {
                if !parquet.exists() {
                    entries.push(entry(path, CleanupReason::OrphanSidecar));
                }
            }
        }

        // interrupted downloads and extractions in the raw tree
        if self.layout.raw_root().is_dir() {
            let mut raw = Vec::new();
            walk_dir(self.layout.raw_root(), &mut raw)?;
            for path in raw {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if name.ends_with(".part") || name.ends_with(".tmp") {
                    entries.push(entry(&path, CleanupReason::TempLeftover));
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Ok(entries)
    }

    pub fn run(&self, options: CleanupOptions) -> Result<CleanupReport, StoreError> {
        let entries = self.scan(options)?;
        let mut report = CleanupReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        for e in entries {
            if options.dry_run {
                info!(path = %e.path.display(), reason = %e.reason, "would remove");
            } else if let Err(err) = fs::remove_file(&e.path) {
                warn!(path = %e.path.display(), error = %err, "failed to remove");
                report.errors.push((e.path.clone(), err.to_string()));
                continue;
            } else {
                info!(path = %e.path.display(), reason = %e.reason, "removed");
            }
            report.entries.push(e);
        }
        info!(
            files = report.entries.len(),
            bytes = report.bytes_reclaimed(),
            dry_run = options.dry_run,
            "cleanup finished"
        );
        Ok(report)
    }
}

fn entry(path: &Path, reason: CleanupReason) -> CleanupEntry {
    CleanupEntry {
        path: path.to_path_buf(),
        reason,
        bytes: file_len(path),
    }
}

fn push_sidecar(entries: &mut Vec<CleanupEntry>, meta: &Path) {
    if meta.exists() {
        entries.push(entry(meta, CleanupReason::OrphanSidecar));
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
