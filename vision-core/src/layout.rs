//! Raw storage layout and upstream addressing.
//!
//! Both directions are pure functions of a [`TaskId`]:
//!
//! - remote: `{base}{kind}/{SYM}/{iv}/{SYM}-{iv}-{date}.zip` for kline kinds,
//!   `{base}{kind}/{SYM}/{SYM}-{kind}-{date}.zip` otherwise
//! - local:  `{raw_root}/{kind}/{SYM}[/{iv}]/{SYM}-{kind}[-{iv}]-{date}.{zip|csv}`
//!
//! Existing raw trees depend on the local shape, so it must not change
//! without a migration.

use crate::domain::{DataKind, DownloadTask, Interval, TaskId};
use chrono::NaiveDate;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default public repository root for USD-M futures daily archives.
pub const DEFAULT_BASE_URL: &str = "https://data.binance.vision/data/futures/um/daily/";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_url: String,
    raw_root: PathBuf,
}

impl StorageLayout {
    pub fn new(base_url: impl Into<String>, raw_root: impl Into<PathBuf>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            raw_root: raw_root.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn raw_root(&self) -> &Path {
        &self.raw_root
    }

    /// Upstream archive URL.
    pub fn remote_url(&self, id: &TaskId) -> String {
        let (kind, sym, date) = (id.kind.as_str(), &id.symbol, id.date);
        match id.interval {
            Some(iv) => format!("{}{kind}/{sym}/{iv}/{sym}-{iv}-{date}.zip", self.base_url),
            None => format!("{}{kind}/{sym}/{sym}-{kind}-{date}.zip", self.base_url),
        }
    }

    /// Upstream SHA-256 sidecar published next to every archive.
    pub fn checksum_url(&self, id: &TaskId) -> String {
        format!("{}.CHECKSUM", self.remote_url(id))
    }

    /// Name of the CSV member inside the upstream archive.
    pub fn archive_member_name(id: &TaskId) -> String {
        let (kind, sym, date) = (id.kind.as_str(), &id.symbol, id.date);
        match id.interval {
            Some(iv) => format!("{sym}-{iv}-{date}.csv"),
            None => format!("{sym}-{kind}-{date}.csv"),
        }
    }

    /// Directory holding a task's local files.
    pub fn task_dir(&self, id: &TaskId) -> PathBuf {
        let dir = self.raw_root.join(id.kind.as_str()).join(&id.symbol);
        match id.interval {
            Some(iv) => dir.join(iv.as_str()),
            None => dir,
        }
    }

    /// Local file name with the given extension.
    pub fn file_name(id: &TaskId, ext: &str) -> String {
        let (kind, sym, date) = (id.kind.as_str(), &id.symbol, id.date);
        match id.interval {
            Some(iv) => format!("{sym}-{kind}-{iv}-{date}.{ext}"),
            None => format!("{sym}-{kind}-{date}.{ext}"),
        }
    }

    pub fn archive_path(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join(Self::file_name(id, "zip"))
    }

    pub fn csv_path(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join(Self::file_name(id, "csv"))
    }

    /// Fully address a task.
    pub fn task(&self, id: TaskId) -> DownloadTask {
        DownloadTask {
            url: self.remote_url(&id),
            checksum_url: self.checksum_url(&id),
            archive_path: self.archive_path(&id),
            csv_path: self.csv_path(&id),
            id,
        }
    }

    /// Recover the task identity from a raw CSV path.
    ///
    /// Returns `None` for anything this layout would not have produced,
    /// including files sitting in the wrong directory.
    pub fn parse_csv_path(&self, path: &Path) -> Option<TaskId> {
        let rel = path.strip_prefix(&self.raw_root).ok()?;
        let parts: Vec<&str> = rel.iter().map(|c| c.to_str()).collect::<Option<_>>()?;

        let (kind, symbol, interval, file) = match parts.as_slice() {
            [kind, symbol, file] => (kind.parse::<DataKind>().ok()?, *symbol, None, *file),
            [kind, symbol, iv, file] => (
                kind.parse::<DataKind>().ok()?,
                *symbol,
                Some(iv.parse::<Interval>().ok()?),
                *file,
            ),
            _ => return None,
        };
        if kind.has_interval() != interval.is_some() {
            return None;
        }

        let stem = file.strip_suffix(".csv")?;
        let date_str = stem.get(stem.len().checked_sub(10)?..)?;
        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()?;

        let id = TaskId::new(kind, symbol, interval, date);
        (Self::file_name(&id, "csv") == file).then_some(id)
    }

    /// Walk the raw tree and list every CSV this layout addresses.
    ///
    /// Sorted by task identity; unknown directories and stray files are ignored.
    pub fn discover_csv_files(&self) -> io::Result<Vec<(TaskId, PathBuf)>> {
        let mut found = Vec::new();
        for kind in DataKind::ALL {
            let kind_dir = self.raw_root.join(kind.as_str());
            for sym_dir in subdirs(&kind_dir)? {
                let leaf_dirs = if kind.has_interval() {
                    subdirs(&sym_dir)?
                } else {
                    vec![sym_dir]
                };
                for dir in leaf_dirs {
                    for entry in fs::read_dir(&dir)? {
                        let path = entry?.path();
                        if let Some(id) = self.parse_csv_path(&path) {
                            found.push((id, path));
                        }
                    }
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

fn subdirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, d).unwrap()
    }

    fn layout() -> StorageLayout {
        StorageLayout::new(DEFAULT_BASE_URL, "/data/raw")
    }

    #[test]
    fn remote_urls_match_upstream_layout() {
        let l = layout();
        let agg = TaskId::new(DataKind::AggTrades, "BTCUSDT", None, date(1));
        assert_eq!(
            l.remote_url(&agg),
            "https://data.binance.vision/data/futures/um/daily/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2024-08-01.zip"
        );
        let kl = TaskId::new(DataKind::Klines, "BTCUSDT", Some(Interval::H1), date(1));
        assert_eq!(
            l.remote_url(&kl),
            "https://data.binance.vision/data/futures/um/daily/klines/BTCUSDT/1h/BTCUSDT-1h-2024-08-01.zip"
        );
        let idx = TaskId::new(DataKind::IndexPriceKlines, "BTCUSDT", Some(Interval::D1), date(1));
        assert_eq!(
            l.remote_url(&idx),
            "https://data.binance.vision/data/futures/um/daily/indexPriceKlines/BTCUSDT/1d/BTCUSDT-1d-2024-08-01.zip"
        );
        assert!(l.checksum_url(&idx).ends_with(".zip.CHECKSUM"));
    }

    #[test]
    fn task_carries_layout_urls() {
        let l = layout();
        let id = TaskId::new(DataKind::Trades, "ETHUSDT", None, date(7));
        let task = l.task(id.clone());
        assert_eq!(task.url, l.remote_url(&id));
        assert_eq!(task.checksum_url, l.checksum_url(&id));
        assert_eq!(task.checksum_url, format!("{}.CHECKSUM", task.url));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let l = StorageLayout::new("https://example.test/daily", "raw");
        assert_eq!(l.base_url(), "https://example.test/daily/");
    }

    #[test]
    fn local_paths_are_deterministic() {
        let l = layout();
        let kl = TaskId::new(DataKind::Klines, "ETHUSDT", Some(Interval::D1), date(2));
        assert_eq!(
            l.csv_path(&kl),
            PathBuf::from("/data/raw/klines/ETHUSDT/1d/ETHUSDT-klines-1d-2024-08-02.csv")
        );
        assert_eq!(
            l.archive_path(&kl),
            PathBuf::from("/data/raw/klines/ETHUSDT/1d/ETHUSDT-klines-1d-2024-08-02.zip")
        );
        assert_eq!(
            StorageLayout::archive_member_name(&kl),
            "ETHUSDT-1d-2024-08-02.csv"
        );
    }

    #[test]
    fn parse_inverts_csv_path() {
        let l = layout();
        let ids = [
            TaskId::new(DataKind::Klines, "BTCUSDT", Some(Interval::M15), date(3)),
            TaskId::new(DataKind::Trades, "SOLUSDT", None, date(4)),
            TaskId::new(DataKind::Metrics, "1000PEPEUSDT", None, date(5)),
        ];
        for id in ids {
            assert_eq!(l.parse_csv_path(&l.csv_path(&id)), Some(id));
        }
    }

    #[test]
    fn parse_rejects_foreign_paths() {
        let l = layout();
        assert_eq!(l.parse_csv_path(Path::new("/elsewhere/klines/BTCUSDT/1d/x.csv")), None);
        assert_eq!(
            l.parse_csv_path(Path::new("/data/raw/klines/BTCUSDT/BTCUSDT-klines-2024-08-01.csv")),
            None
        );
        assert_eq!(
            l.parse_csv_path(Path::new(
                "/data/raw/aggTrades/BTCUSDT/ETHUSDT-aggTrades-2024-08-01.csv"
            )),
            None
        );
        assert_eq!(
            l.parse_csv_path(Path::new(
                "/data/raw/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2024-08-01.zip"
            )),
            None
        );
    }

    #[test]
    fn discover_walks_raw_tree() {
        let dir = tempfile::tempdir().unwrap();
        let l = StorageLayout::new(DEFAULT_BASE_URL, dir.path());
        let a = TaskId::new(DataKind::Klines, "BTCUSDT", Some(Interval::D1), date(1));
        let b = TaskId::new(DataKind::AggTrades, "BTCUSDT", None, date(1));
        for id in [&a, &b] {
            fs::create_dir_all(l.task_dir(id)).unwrap();
            fs::write(l.csv_path(id), "1,2\n").unwrap();
        }
        fs::write(l.task_dir(&a).join("notes.txt"), "x").unwrap();

        let found = l.discover_csv_files().unwrap();
        let ids: Vec<_> = found.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, b]);
    }
}
