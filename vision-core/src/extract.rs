//! Archive extractor: validate a downloaded zip, then write its CSV atomically.

use crate::error::TaskError;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result of one successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub csv_path: PathBuf,
    pub bytes: u64,
    pub archive_removed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor {
    delete_archive: bool,
}

impl ArchiveExtractor {
    pub fn new(delete_archive: bool) -> Self {
        Self { delete_archive }
    }

    /// Extract the single CSV member of `archive` to `csv_path`.
    ///
    /// The member is read in full (which checks its CRC) before anything is
    /// written, and the target is replaced by rename, so a corrupt archive
    /// never touches an existing CSV. Running twice on the same archive
    /// produces the same bytes.
    pub fn extract(&self, archive: &Path, csv_path: &Path) -> Result<ExtractOutcome, TaskError> {
        let contents = read_single_csv(archive)?;

        if let Some(parent) = csv_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = csv_path.with_extension("csv.tmp");
        fs::write(&tmp, &contents)?;
        if let Err(e) = fs::rename(&tmp, csv_path) {
            let _ = fs::remove_file(&tmp);
            return Err(TaskError::Io(format!("atomic rename failed: {e}")));
        }

        let archive_removed = if self.delete_archive {
            fs::remove_file(archive)?;
            debug!(archive = %archive.display(), "deleted archive after extraction");
            true
        } else {
            false
        };

        Ok(ExtractOutcome {
            csv_path: csv_path.to_path_buf(),
            bytes: contents.len() as u64,
            archive_removed,
        })
    }
}

fn read_single_csv(archive: &Path) -> Result<Vec<u8>, TaskError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| TaskError::Integrity(format!("corrupt archive {}: {e}", archive.display())))?;

    let members: Vec<usize> = (0..zip.len())
        .filter(|&i| {
            zip.name_for_index(i)
                .is_some_and(|name| name.ends_with(".csv") && !name.ends_with('/'))
        })
        .collect();
    let index = match members.as_slice() {
        [only] => *only,
        [] => {
            return Err(TaskError::Integrity(format!(
                "no CSV member in {}",
                archive.display()
            )))
        }
        _ => {
            return Err(TaskError::Integrity(format!(
                "{} CSV members in {}, expected one",
                members.len(),
                archive.display()
            )))
        }
    };

    let mut member = zip
        .by_index(index)
        .map_err(|e| TaskError::Integrity(format!("unreadable member: {e}")))?;
    let mut contents = Vec::with_capacity(member.size() as usize);
    member
        .read_to_end(&mut contents)
        .map_err(|e| TaskError::Integrity(format!("corrupt member data: {e}")))?;

    if contents.is_empty() {
        return Err(TaskError::Integrity(format!(
            "empty CSV member in {}",
            archive.display()
        )));
    }
    Ok(contents)
}
