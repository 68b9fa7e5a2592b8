//! Batch aggregate and final report
//!
//! A [`BatchRun`] is shared by every job task of one `process_batch` call.
//! All counters and lists sit behind a single lock so "count a completion"
//! and "append to a list" can never be observed apart.

use crate::job::{Job, JobState, SKIPPED_DIAGNOSTIC};
use crate::report::TimeRemaining;
use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Terminal state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every job ran and no stop was requested
    Completed,
    /// A stop was requested before the batch finished
    Cancelled,
}

/// A file that did not succeed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub path: PathBuf,
    pub diagnostic: String,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    succeeded: Vec<PathBuf>,
    failed: Vec<JobFailure>,
    skipped: Vec<PathBuf>,
}

/// Snapshot taken when a job outcome is recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub completed: usize,
    pub total: usize,
    /// `completed / total * 100`
    pub overall: f32,
    pub remaining: TimeRemaining,
}

/// Shared state of one running batch.
#[derive(Debug)]
pub struct BatchRun {
    total: usize,
    concurrency: usize,
    started: Instant,
    started_at: DateTime<Local>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    tally: Mutex<Tally>,
}

impl BatchRun {
    pub fn new(total: usize, concurrency: usize) -> Self {
        Self {
            total,
            concurrency,
            started: Instant::now(),
            started_at: Local::now(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            tally: Mutex::new(Tally::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The stop flag, for handing to the encoder.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Set the stop flag. Returns false if the batch already finished or was already stopped.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Jobs with a succeeded or failed outcome; skipped jobs are not counted.
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Fold a finished job into the aggregate.
    pub fn record(&self, job: &Job) -> Completion {
        let mut tally = self.lock();
        match &job.state {
            JobState::Succeeded => {
                tally.completed += 1;
                tally.succeeded.push(job.input_path.clone());
            }
            JobState::Failed(_) | JobState::Cancelled => {
                tally.completed += 1;
                tally.failed.push(JobFailure {
                    path: job.input_path.clone(),
                    diagnostic: job.diagnostic().unwrap_or_default(),
                });
            }
            JobState::SkippedDueToCancellation => tally.skipped.push(job.input_path.clone()),
            JobState::Pending | JobState::Running => {}
        }
        debug_assert!(tally.completed + tally.skipped.len() <= self.total);

        let completed = tally.completed;
        drop(tally);
        self.completion(completed)
    }

    fn completion(&self, completed: usize) -> Completion {
        let overall = if self.total == 0 {
            100.0
        } else {
            completed as f32 / self.total as f32 * 100.0
        };
        Completion {
            completed,
            total: self.total,
            overall,
            remaining: TimeRemaining::estimate(self.elapsed(), completed, self.total),
        }
    }

    /// Close the batch and build its report. Later stop requests are ignored.
    pub fn finish(&self) -> BatchReport {
        self.finished.store(true, Ordering::SeqCst);
        let tally = self.lock();
        BatchReport {
            state: if self.is_cancelled() {
                BatchOutcome::Cancelled
            } else {
                BatchOutcome::Completed
            },
            started_at: self.started_at.to_rfc3339(),
            total: self.total,
            succeeded: tally.succeeded.clone(),
            failed: tally.failed.clone(),
            skipped: tally.skipped.clone(),
            elapsed: self.elapsed(),
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Final tallies of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub state: BatchOutcome,
    /// RFC 3339 local start time
    pub started_at: String,
    pub total: usize,
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<JobFailure>,
    /// Jobs that never started because of a stop request
    pub skipped: Vec<PathBuf>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.state == BatchOutcome::Completed && self.succeeded.len() == self.total
    }

    /// One-line summary for the status display.
    pub fn summary(&self) -> String {
        let succeeded = self.succeeded.len();
        let failed = self.failed.len();
        match self.state {
            BatchOutcome::Cancelled => format!(
                "Processing stopped: {}/{} succeeded, {} failed, {} skipped",
                succeeded,
                self.total,
                failed,
                self.skipped.len()
            ),
            BatchOutcome::Completed if self.total == 0 => "No videos to process".to_string(),
            BatchOutcome::Completed if succeeded == self.total => {
                format!("All {} videos rotated successfully", self.total)
            }
            BatchOutcome::Completed if succeeded == 0 => {
                format!("All {} videos failed to rotate", self.total)
            }
            BatchOutcome::Completed => format!(
                "{}/{} videos rotated successfully, {} failed",
                succeeded, self.total, failed
            ),
        }
    }

    /// Summary followed by one line per file that did not succeed.
    pub fn details(&self) -> Vec<String> {
        let mut lines = vec![self.summary()];
        for failure in &self.failed {
            let first = failure.diagnostic.lines().next().unwrap_or_default();
            lines.push(format!("  {}: {}", failure.path.display(), first));
        }
        for path in &self.skipped {
            lines.push(format!("  {}: {}", path.display(), SKIPPED_DIAGNOSTIC));
        }
        lines
    }

    /// `(succeeded, failed)`, with skipped jobs listed among the failures.
    pub fn into_results(self) -> (Vec<PathBuf>, Vec<(PathBuf, String)>) {
        let mut failed: Vec<(PathBuf, String)> = self
            .failed
            .into_iter()
            .map(|f| (f.path, f.diagnostic))
            .collect();
        failed.extend(
            self.skipped
                .into_iter()
                .map(|path| (path, SKIPPED_DIAGNOSTIC.to_string())),
        );
        (self.succeeded, failed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
