//! Progress callbacks for download runs.

use crate::domain::{TaskOutcome, TaskStatus};
use crate::pool::RunSummary;
use tracing::{info, warn};

pub trait DownloadProgress: Send + Sync {
    /// Called once before any task runs.
    fn on_start(&self, total: usize);

    /// Called after each task reaches a terminal status. `done` is 1-based.
    fn on_complete(&self, outcome: &TaskOutcome, done: usize, total: usize);

    /// Called when the whole batch is done.
    fn on_batch_complete(&self, summary: &RunSummary);
}

/// Discards all progress events.
pub struct NoProgress;

impl DownloadProgress for NoProgress {
    fn on_start(&self, _total: usize) {}
    fn on_complete(&self, _outcome: &TaskOutcome, _done: usize, _total: usize) {}
    fn on_batch_complete(&self, _summary: &RunSummary) {}
}

/// Logs each failure, a progress line every `every` tasks, and the final summary.
pub struct LogProgress {
    every: usize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(10)
    }
}

impl DownloadProgress for LogProgress {
    fn on_start(&self, total: usize) {
        info!(tasks = total, "starting downloads");
    }

    fn on_complete(&self, outcome: &TaskOutcome, done: usize, total: usize) {
        if outcome.status == TaskStatus::Failed {
            if let Some(err) = &outcome.error {
                warn!(task = %outcome.id, attempts = outcome.attempts, error = %err, "task failed");
            }
        }
        if done % self.every == 0 || done == total {
            let pct = done as f64 / total.max(1) as f64 * 100.0;
            info!("progress: {done}/{total} ({pct:.1}%)");
        }
    }

    fn on_batch_complete(&self, summary: &RunSummary) {
        info!(
            total = summary.total,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            downloaded = %format_file_size(summary.bytes_downloaded()),
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "download run finished"
        );
    }
}

/// Human-readable byte count, e.g. `1.50MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0B".into();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2}{}", UNITS[unit])
}
