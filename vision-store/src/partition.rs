//! Hive-style partitioned Parquet store.
//!
//! Layout: `{root}/data_type={kind}[/interval={iv}]/date={YYYY-MM-DD}/symbol={SYM}.parquet`
//!
//! - One self-contained file per partition key
//! - Atomic writes (write to `.tmp`, rename into place)
//! - Metadata sidecar per partition (rows, time bounds, source hash)
//! - `_manifest.json` at the root pins the layout version

use crate::error::StoreError;
use crate::schema::KindSchema;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vision_core::resume::{FileState, ResumeIndex};
use vision_core::{DataKind, Interval, TaskId};

/// Version of the on-disk addressing scheme. Bump only with a migration.
pub const LAYOUT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "_manifest.json";

/// Identity of one stored partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub kind: DataKind,
    pub interval: Option<Interval>,
    pub date: NaiveDate,
    pub symbol: String,
}

impl PartitionKey {
    pub fn task_id(&self) -> TaskId {
        TaskId::new(self.kind, self.symbol.clone(), self.interval, self.date)
    }
}

impl From<&TaskId> for PartitionKey {
    fn from(id: &TaskId) -> Self {
        Self {
            kind: id.kind,
            interval: id.interval,
            date: id.date,
            symbol: id.symbol.clone(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data_type={}", self.kind)?;
        if let Some(iv) = self.interval {
            write!(f, "/interval={iv}")?;
        }
        write!(f, "/date={}/symbol={}", self.date, self.symbol)
    }
}

/// Sidecar written next to every partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub rows: usize,
    pub min_time: i64,
    pub max_time: i64,
    pub source: String,
    /// BLAKE3 of the source CSV bytes.
    pub source_hash: String,
    pub written_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub layout_version: u32,
    pub created_at: NaiveDateTime,
}

/// Per-kind totals from the sidecars.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStatus {
    pub partitions: usize,
    pub rows: usize,
    pub bytes: u64,
    pub symbols: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// Partitions without a readable sidecar.
    pub missing_meta: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub layout_version: Option<u32>,
    /// Keyed by `kind` or `kind/interval`.
    pub kinds: BTreeMap<String, KindStatus>,
}

/// The partition store.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open an existing store, refusing one written under another layout version.
    ///
    /// A store without a manifest is accepted (nothing has pinned it yet).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        store.check_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── addressing ──────────────────────────────────────────────────

    /// `{root}/data_type={kind}[/interval={iv}]`
    pub fn kind_dir(&self, kind: DataKind, interval: Option<Interval>) -> PathBuf {
        let dir = self.root.join(format!("data_type={kind}"));
        match interval {
            Some(iv) => dir.join(format!("interval={iv}")),
            None => dir,
        }
    }

    pub fn date_dir(&self, kind: DataKind, interval: Option<Interval>, date: NaiveDate) -> PathBuf {
        self.kind_dir(kind, interval).join(format!("date={date}"))
    }

    pub fn parquet_path(&self, key: &PartitionKey) -> PathBuf {
        self.date_dir(key.kind, key.interval, key.date)
            .join(format!("symbol={}.parquet", key.symbol))
    }

    pub fn meta_path(&self, key: &PartitionKey) -> PathBuf {
        self.date_dir(key.kind, key.interval, key.date)
            .join(format!("symbol={}.meta.json", key.symbol))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Recover the key from a partition file path; `None` for anything else.
    pub fn parse_parquet_path(&self, path: &Path) -> Option<PartitionKey> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
        let (kind, interval, date, file) = match parts.as_slice() {
            [kind, date, file] => (*kind, None, *date, *file),
            [kind, iv, date, file] => (*kind, Some(*iv), *date, *file),
            _ => return None,
        };
        let kind: DataKind = kind.strip_prefix("data_type=")?.parse().ok()?;
        let interval = match interval {
            Some(iv) => Some(iv.strip_prefix("interval=")?.parse::<Interval>().ok()?),
            None => None,
        };
        if kind.has_interval() != interval.is_some() {
            return None;
        }
        let date = NaiveDate::parse_from_str(date.strip_prefix("date=")?, "%Y-%m-%d").ok()?;
        let symbol = file.strip_prefix("symbol=")?.strip_suffix(".parquet")?;
        if symbol.is_empty() {
            return None;
        }
        Some(PartitionKey {
            kind,
            interval,
            date,
            symbol: symbol.to_string(),
        })
    }

    // ── manifest ────────────────────────────────────────────────────

    pub fn read_manifest(&self) -> Result<Option<StoreManifest>, StoreError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::integrity(&path, format!("unreadable manifest: {e}")))
    }

    pub fn check_layout(&self) -> Result<(), StoreError> {
        match self.read_manifest()? {
            Some(m) if m.layout_version != LAYOUT_VERSION => Err(StoreError::LayoutVersion {
                found: m.layout_version,
                expected: LAYOUT_VERSION,
            }),
            _ => Ok(()),
        }
    }

    /// Create the root and pin the layout version. Idempotent.
    pub fn init(&self) -> Result<StoreManifest, StoreError> {
        if let Some(existing) = self.read_manifest()? {
            self.check_layout()?;
            return Ok(existing);
        }
        fs::create_dir_all(&self.root)?;
        let manifest = StoreManifest {
            layout_version: LAYOUT_VERSION,
            created_at: chrono::Utc::now().naive_utc(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| StoreError::Parquet(format!("manifest serialization: {e}")))?;
        write_atomic(&self.manifest_path(), json.as_bytes())?;
        info!(root = %self.root.display(), version = LAYOUT_VERSION, "initialised store");
        Ok(manifest)
    }

    // ── partition I/O ───────────────────────────────────────────────

    /// Write one partition and its sidecar.
    ///
    /// The Parquet file is written to `.tmp` and renamed into place, so
    /// readers only ever see complete files. The sidecar goes last; a
    /// partition whose sidecar is missing gets rebuilt on the next ETL run.
    pub fn write(
        &self,
        key: &PartitionKey,
        df: &mut DataFrame,
        meta: &PartitionMeta,
    ) -> Result<(), StoreError> {
        let path = self.parquet_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp_path = path.with_extension("parquet.tmp");
        if let Err(e) = write_parquet(df, &tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::PartialWrite {
                path: path.display().to_string(),
                reason: format!("atomic rename failed: {e}"),
            }
        })?;

        let meta_json = serde_json::to_string_pretty(meta)
            .map_err(|e| StoreError::Parquet(format!("meta serialization: {e}")))?;
        write_atomic(&self.meta_path(key), meta_json.as_bytes())?;
        debug!(partition = %key, rows = meta.rows, "wrote partition");
        Ok(())
    }

    /// Read a partition, checking magic bytes, schema and row count.
    pub fn read(&self, key: &PartitionKey) -> Result<DataFrame, StoreError> {
        let path = self.parquet_path(key);
        match ResumeIndex::new().inspect(&path) {
            FileState::PresentValid => {}
            FileState::Missing => {
                return Err(StoreError::integrity(&path, "partition file missing"))
            }
            FileState::PresentInvalid(reason) => return Err(StoreError::integrity(&path, reason)),
        }
        let file = fs::File::open(&path)?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| StoreError::integrity(&path, format!("unreadable parquet: {e}")))?;
        if df.height() == 0 {
            return Err(StoreError::integrity(&path, "empty partition"));
        }
        KindSchema::for_kind(key.kind)
            .validate(&df)
            .map_err(|e| StoreError::integrity(&path, e.to_string()))?;
        Ok(df)
    }

    pub fn read_meta(&self, key: &PartitionKey) -> Option<PartitionMeta> {
        let content = fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Cheap validity check: file present with Parquet magic, sidecar readable.
    pub fn inspect(&self, key: &PartitionKey) -> FileState {
        match ResumeIndex::new().inspect(&self.parquet_path(key)) {
            FileState::PresentValid if self.read_meta(key).is_none() => {
                FileState::PresentInvalid("missing or unreadable sidecar".into())
            }
            state => state,
        }
    }

    // ── enumeration ─────────────────────────────────────────────────

    /// Partitions stored in one date directory.
    pub fn keys_in_date_dir(
        &self,
        kind: DataKind,
        interval: Option<Interval>,
        date: NaiveDate,
    ) -> Result<Vec<PartitionKey>, StoreError> {
        let dir = self.date_dir(kind, interval, date);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            if let Some(key) = self.parse_parquet_path(&entry?.path()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Dates that have a `date=` directory for this kind and interval, sorted.
    pub fn partition_dates(
        &self,
        kind: DataKind,
        interval: Option<Interval>,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let entries = match fs::read_dir(self.kind_dir(kind, interval)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dates = Vec::new();
        for entry in entries {
            let entry = entry?;
            let date = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("date="))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            if let Some(date) = date.filter(|_| entry.path().is_dir()) {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Every file under the root, recursively, sorted.
    pub fn walk_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        if self.root.is_dir() {
            walk_dir(&self.root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    /// Every partition key in the store, sorted.
    pub fn list_partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let mut keys: Vec<PartitionKey> = self
            .walk_files()?
            .iter()
            .filter_map(|p| self.parse_parquet_path(p))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Summarise the store from its sidecars.
    pub fn status(&self) -> Result<StoreStatus, StoreError> {
        let layout_version = self.read_manifest()?.map(|m| m.layout_version);
        let mut kinds: BTreeMap<String, KindStatus> = BTreeMap::new();
        let mut symbols: BTreeMap<String, std::collections::BTreeSet<String>> = BTreeMap::new();

        for key in self.list_partitions()? {
            let label = match key.interval {
                Some(iv) => format!("{}/{iv}", key.kind),
                None => key.kind.to_string(),
            };
            let entry = kinds.entry(label.clone()).or_default();
            entry.partitions += 1;
            entry.bytes += fs::metadata(self.parquet_path(&key)).map(|m| m.len()).unwrap_or(0);
            match self.read_meta(&key) {
                Some(meta) => entry.rows += meta.rows,
                None => entry.missing_meta += 1,
            }
            entry.first_date = Some(entry.first_date.map_or(key.date, |d| d.min(key.date)));
            entry.last_date = Some(entry.last_date.map_or(key.date, |d| d.max(key.date)));
            symbols.entry(label).or_default().insert(key.symbol);
        }
        for (label, syms) in symbols {
            if let Some(entry) = kinds.get_mut(&label) {
                entry.symbols = syms.len();
            }
        }
        Ok(StoreStatus {
            layout_version,
            kinds,
        })
    }
}

/// Collect every regular file under `dir`.
pub(crate) fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

/// Write small files through a temp name so readers never see partial JSON.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::PartialWrite {
            path: path.display().to_string(),
            reason: format!("atomic rename failed: {e}"),
        }
    })
}
