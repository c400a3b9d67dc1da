//! Resume/skip index: decides whether a local file can be trusted.
//!
//! A file only counts as present-valid when its contents prove the write
//! finished. Partial downloads live under `*.part` names and never reach
//! the target path, so a truncated target means something else went wrong
//! and it is reported as present-invalid.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    Missing,
    PresentValid,
    PresentInvalid(String),
}

impl FileState {
    pub fn is_valid(&self) -> bool {
        matches!(self, FileState::PresentValid)
    }
}

/// Stateless inspection of the local filesystem, dispatching on file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeIndex;

impl ResumeIndex {
    pub fn new() -> Self {
        Self
    }

    /// Classify the file at `path`.
    pub fn inspect(&self, path: &Path) -> FileState {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return FileState::Missing,
            Err(e) => return FileState::PresentInvalid(format!("stat failed: {e}")),
        };
        if !meta.is_file() {
            return FileState::PresentInvalid("not a regular file".into());
        }
        if meta.len() == 0 {
            return FileState::PresentInvalid("zero-byte file".into());
        }

        let checked = match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => check_csv(path),
            Some("zip") => check_zip(path),
            Some("parquet") => check_parquet(path, meta.len()),
            _ => Ok(()),
        };
        match checked {
            Ok(()) => FileState::PresentValid,
            Err(reason) => FileState::PresentInvalid(reason),
        }
    }
}

/// At least one data row after an optional header line.
fn check_csv(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("open: {e}"))?;
    let mut lines = BufReader::new(file).lines();

    let first = match lines.next() {
        Some(line) => line.map_err(|e| format!("read: {e}"))?,
        None => return Err("empty file".into()),
    };
    if is_data_row(&first) {
        return Ok(());
    }
    for line in lines {
        let line = line.map_err(|e| format!("read: {e}"))?;
        if !line.trim().is_empty() {
            return Ok(());
        }
    }
    Err("header only, no data rows".into())
}

/// Upstream headers are column names; data rows start with a number or a
/// `YYYY-MM-DD` timestamp.
fn is_data_row(line: &str) -> bool {
    line.split(',')
        .next()
        .map(|f| f.trim().chars().next().is_some_and(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn check_zip(path: &Path) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("open: {e}"))?;
    let archive = zip::ZipArchive::new(file).map_err(|e| format!("corrupt archive: {e}"))?;
    if archive.is_empty() {
        return Err("archive has no entries".into());
    }
    Ok(())
}

/// Parquet files begin and end with `PAR1`; a truncated write loses the footer.
fn check_parquet(path: &Path, len: u64) -> Result<(), String> {
    if len < 12 {
        return Err(format!("truncated ({len} bytes)"));
    }
    let mut file = File::open(path).map_err(|e| format!("open: {e}"))?;
    let mut head = [0u8; 4];
    let mut tail = [0u8; 4];
    file.read_exact(&mut head)
        .and_then(|_| file.seek(SeekFrom::End(-4)))
        .and_then(|_| file.read_exact(&mut tail))
        .map_err(|e| format!("read: {e}"))?;
    if &head != PARQUET_MAGIC || &tail != PARQUET_MAGIC {
        return Err("missing parquet magic (truncated or not parquet)".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            ResumeIndex::new().inspect(&dir.path().join("nope.csv")),
            FileState::Missing
        );
    }

    #[test]
    fn zero_byte_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        File::create(&path).unwrap();
        assert!(matches!(
            ResumeIndex::new().inspect(&path),
            FileState::PresentInvalid(_)
        ));
    }

    #[test]
    fn csv_header_only_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, "open_time,open,high,low,close\n").unwrap();
        assert_eq!(
            ResumeIndex::new().inspect(&path),
            FileState::PresentInvalid("header only, no data rows".into())
        );
    }

    #[test]
    fn csv_with_rows_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let with_header = dir.path().join("a.csv");
        fs::write(&with_header, "open_time,open\n1735689600000,1.0\n").unwrap();
        let headerless = dir.path().join("b.csv");
        fs::write(&headerless, "1735689600000,1.0\n").unwrap();

        let index = ResumeIndex::new();
        assert!(index.inspect(&with_header).is_valid());
        assert!(index.inspect(&headerless).is_valid());
    }

    #[test]
    fn zip_garbage_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        fs::write(&path, b"definitely not a zip archive").unwrap();
        assert!(matches!(
            ResumeIndex::new().inspect(&path),
            FileState::PresentInvalid(_)
        ));
    }

    #[test]
    fn zip_with_entry_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("a.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"1,2\n").unwrap();
        writer.finish().unwrap();
        assert!(ResumeIndex::new().inspect(&path).is_valid());
    }

    #[test]
    fn parquet_magic_checked_at_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.parquet");
        fs::write(&good, b"PAR1\x00\x00\x00\x00\x00\x00PAR1").unwrap();
        let truncated = dir.path().join("bad.parquet");
        fs::write(&truncated, b"PAR1\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();

        let index = ResumeIndex::new();
        assert!(index.inspect(&good).is_valid());
        assert!(!index.inspect(&truncated).is_valid());
    }
}
