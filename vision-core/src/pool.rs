//! Rate-limited download worker pool.
//!
//! At most `concurrency` tasks run at once on a dedicated rayon pool. Every
//! request (archive or checksum) passes through the shared [`RateGate`]
//! first. Each task walks the retry state machine on its own; a task that
//! exhausts its attempts is reported failed and the rest of the batch keeps
//! going.

use crate::checksum;
use crate::domain::{DownloadTask, TaskId, TaskOutcome, TaskStatus};
use crate::error::TaskError;
use crate::extract::ArchiveExtractor;
use crate::fetch::ArchiveFetcher;
use crate::progress::DownloadProgress;
use crate::rate_gate::RateGate;
use crate::resume::{FileState, ResumeIndex};
use crate::retry::{AttemptState, RetryPolicy};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build worker pool: {0}")]
    Build(String),
}

/// Knobs for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub auto_extract: bool,
    pub delete_archive: bool,
    pub overwrite_existing: bool,
    pub verify_checksum: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry: RetryPolicy::fixed(3, Duration::from_secs(5)),
            auto_extract: true,
            delete_archive: true,
            overwrite_existing: false,
            verify_checksum: false,
        }
    }
}

enum Resume {
    Skip,
    ExtractLocal,
    Download,
}

pub struct DownloadPool {
    fetcher: Arc<dyn ArchiveFetcher>,
    gate: Arc<RateGate>,
    settings: PoolSettings,
    index: ResumeIndex,
    extractor: ArchiveExtractor,
    in_flight: Mutex<HashSet<TaskId>>,
    workers: rayon::ThreadPool,
}

impl DownloadPool {
    pub fn new(
        fetcher: Arc<dyn ArchiveFetcher>,
        gate: Arc<RateGate>,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.concurrency.max(1))
            .thread_name(|i| format!("download-{i}"))
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;
        Ok(Self {
            fetcher,
            gate,
            extractor: ArchiveExtractor::new(settings.delete_archive),
            settings,
            index: ResumeIndex::new(),
            in_flight: Mutex::new(HashSet::new()),
            workers,
        })
    }

    /// Run every task to a terminal status.
    ///
    /// Duplicate task identities are collapsed before anything is scheduled.
    /// Outcomes come back in input order.
    pub fn run(&self, tasks: Vec<DownloadTask>, progress: &dyn DownloadProgress) -> RunSummary {
        let started = Instant::now();
        let submitted = tasks.len();
        let mut seen = HashSet::new();
        let tasks: Vec<DownloadTask> = tasks
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect();
        if tasks.len() < submitted {
            warn!(
                dropped = submitted - tasks.len(),
                "collapsed duplicate task identities"
            );
        }

        let total = tasks.len();
        progress.on_start(total);
        let done = AtomicUsize::new(0);

        let outcomes: Vec<TaskOutcome> = self.workers.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let outcome = self.process(task);
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.on_complete(&outcome, n, total);
                    outcome
                })
                .collect()
        });

        let summary = RunSummary::from_outcomes(outcomes, started.elapsed());
        progress.on_batch_complete(&summary);
        summary
    }

    fn process(&self, task: &DownloadTask) -> TaskOutcome {
        match self.resume_decision(task) {
            Resume::Skip => {
                debug!(task = %task.id, "already present and valid, skipping");
                return TaskOutcome::skipped(task.id.clone());
            }
            Resume::ExtractLocal => {
                match self.extractor.extract(&task.archive_path, &task.csv_path) {
                    Ok(out) => {
                        info!(task = %task.id, "extracted previously downloaded archive");
                        return TaskOutcome::completed(task.id.clone(), 0, Some(out.bytes));
                    }
                    Err(e) => {
                        warn!(task = %task.id, error = %e, "local archive unusable, downloading again");
                        let _ = fs::remove_file(&task.archive_path);
                    }
                }
            }
            Resume::Download => {}
        }

        let Some(_guard) = InFlightGuard::claim(&self.in_flight, &task.id) else {
            warn!(task = %task.id, "identical task already in flight");
            return TaskOutcome::failed(task.id.clone(), 0, TaskError::InFlight);
        };

        let policy = &self.settings.retry;
        let state = policy.drive(
            |attempt| {
                debug!(
                    task = %task.id,
                    "downloading [{attempt}/{}]: {}",
                    policy.max_attempts,
                    task.url
                );
                self.attempt(task)
            },
            |attempt, error, delay| {
                warn!(
                    task = %task.id,
                    attempt,
                    error = %error,
                    retry_in_secs = delay.as_secs_f64(),
                    "download attempt failed, retrying"
                );
            },
        );

        match state {
            AttemptState::Succeeded { attempts, bytes } => {
                TaskOutcome::completed(task.id.clone(), attempts, Some(bytes))
            }
            AttemptState::Failed { attempts, error } => {
                TaskOutcome::failed(task.id.clone(), attempts, error)
            }
            other => TaskOutcome::failed(
                task.id.clone(),
                other.attempts(),
                TaskError::Io(format!("retry loop ended in non-terminal state {other:?}")),
            ),
        }
    }

    fn resume_decision(&self, task: &DownloadTask) -> Resume {
        if self.settings.overwrite_existing {
            return Resume::Download;
        }
        let target = if self.settings.auto_extract {
            &task.csv_path
        } else {
            &task.archive_path
        };
        match self.index.inspect(target) {
            FileState::PresentValid => Resume::Skip,
            FileState::PresentInvalid(reason) => {
                warn!(task = %task.id, reason = %reason, "local file invalid, repairing");
                Resume::Download
            }
            FileState::Missing => {
                if self.settings.auto_extract && self.index.inspect(&task.archive_path).is_valid() {
                    Resume::ExtractLocal
                } else {
                    Resume::Download
                }
            }
        }
    }

    /// One network attempt: fetch, optionally verify, optionally extract.
    ///
    /// Any integrity failure removes the archive so the next attempt starts
    /// from a clean slate.
    fn attempt(&self, task: &DownloadTask) -> Result<u64, TaskError> {
        if let Some(dir) = task.archive_path.parent() {
            fs::create_dir_all(dir)?;
        }

        self.gate.acquire();
        let bytes = self.fetcher.fetch(&task.url, &task.archive_path)?;

        if self.settings.verify_checksum {
            if let Err(e) = self.verify_checksum(task) {
                let _ = fs::remove_file(&task.archive_path);
                return Err(e);
            }
        }

        if self.settings.auto_extract {
            if let Err(e) = self.extractor.extract(&task.archive_path, &task.csv_path) {
                let _ = fs::remove_file(&task.archive_path);
                return Err(e);
            }
        }
        Ok(bytes)
    }

    fn verify_checksum(&self, task: &DownloadTask) -> Result<(), TaskError> {
        self.gate.acquire();
        match self.fetcher.fetch_text(&task.checksum_url) {
            Ok(body) => {
                let expected = checksum::parse_checksum(&body)?;
                checksum::verify_file(&task.archive_path, &expected)
            }
            // older archives were published without sidecars
            Err(TaskError::NotFound { .. }) => {
                warn!(task = %task.id, "no checksum published, skipping verification");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Holds a task identity in the in-flight set until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<TaskId>>,
    id: TaskId,
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<TaskId>>, id: &TaskId) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.insert(id.clone()).then(|| Self {
            set,
            id: id.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Aggregated result of one pool run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<TaskOutcome>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: Vec<TaskOutcome>, elapsed: Duration) -> Self {
        let count = |s: TaskStatus| outcomes.iter().filter(|o| o.status == s).count();
        Self {
            total: outcomes.len(),
            completed: count(TaskStatus::Completed),
            skipped: count(TaskStatus::Skipped),
            failed: count(TaskStatus::Failed),
            outcomes,
            elapsed,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Failed)
    }

    /// Identities to feed back into a follow-up run.
    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.failures().map(|o| o.id.clone()).collect()
    }

    /// Total network attempts across all tasks (zero for skips).
    pub fn network_attempts(&self) -> u32 {
        self.outcomes.iter().map(|o| o.attempts).sum()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.outcomes.iter().filter_map(|o| o.bytes).sum()
    }

    /// Persist the failed subset as JSON so it can be replayed alone.
    pub fn write_failed(&self, path: &Path) -> io::Result<()> {
        let failed: Vec<&TaskOutcome> = self.failures().collect();
        let json = serde_json::to_string_pretty(&failed).map_err(io::Error::other)?;
        fs::write(path, json)
    }
}

/// Load task identities written by [`RunSummary::write_failed`].
pub fn read_failed(path: &Path) -> io::Result<Vec<TaskId>> {
    let content = fs::read_to_string(path)?;
    let outcomes: Vec<TaskOutcome> = serde_json::from_str(&content).map_err(io::Error::other)?;
    Ok(outcomes.into_iter().map(|o| o.id).collect())
}
