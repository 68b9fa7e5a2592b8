//! Rotation jobs
//!
//! One job per input file. A job is owned by the task that runs it until its
//! outcome has been folded into the batch.

use crate::config::{Acceleration, Rotation};
use crate::encode::EncodeError;
use crate::resolve::ResolveError;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Diagnostic for a job that was killed by a stop request
pub const STOPPED_DIAGNOSTIC: &str = "stopped while encoding; partial output may remain";

/// Diagnostic for a job that never started because processing was stopped
pub const SKIPPED_DIAGNOSTIC: &str = "skipped: processing was stopped";

/// Error type for a single job
#[derive(Debug, Error)]
pub enum JobError {
    /// Output path could not be resolved or its directory created
    #[error("{0}")]
    Resolve(#[from] ResolveError),

    /// Encoding failed
    #[error("{0}")]
    Encode(#[from] EncodeError),

    /// Output exists and the batch does not overwrite
    #[error("Output already exists: {}", .0.display())]
    OutputExists(PathBuf),

    /// The resolved output would replace the input
    #[error("Output path is the input file: {}", .0.display())]
    OutputIsInput(PathBuf),
}

impl JobError {
    /// Text recorded against the job in the failed list.
    pub fn diagnostic(&self) -> String {
        match self {
            JobError::Encode(e) => e.diagnostic(),
            other => other.to_string(),
        }
    }

    /// Whether the job was interrupted by a stop rather than failing on its own.
    pub fn is_stopped(&self) -> bool {
        matches!(self, JobError::Encode(EncodeError::Stopped))
    }
}

/// Job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker slot
    Pending,
    /// Encoder running
    Running,
    Succeeded,
    /// Failed with a diagnostic
    Failed(String),
    /// Killed mid-encode by a stop request
    Cancelled,
    /// Never started because a stop was requested first
    SkippedDueToCancellation,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
            JobState::SkippedDueToCancellation => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

/// One rotation task
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier
    pub id: String,
    /// Absolute path to the input video file
    pub input_path: PathBuf,
    /// Output path, set once resolved
    pub output_path: Option<PathBuf>,
    pub rotation: Rotation,
    /// Acceleration requested for the job; the encoder may still fall back
    pub acceleration: Acceleration,
    pub state: JobState,
}

impl Job {
    pub fn new(input_path: PathBuf, rotation: Rotation, acceleration: Acceleration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_path,
            output_path: None,
            rotation,
            acceleration,
            state: JobState::Pending,
        }
    }

    pub fn start(&mut self) {
        self.state = JobState::Running;
    }

    pub fn succeed(&mut self) {
        self.state = JobState::Succeeded;
    }

    /// Record a failure; a stop-induced kill becomes `Cancelled`.
    pub fn fail(&mut self, error: &JobError) {
        self.state = if error.is_stopped() {
            JobState::Cancelled
        } else {
            JobState::Failed(error.diagnostic())
        };
    }

    pub fn skip(&mut self) {
        self.state = JobState::SkippedDueToCancellation;
    }

    /// Diagnostic to list against this job, if it did not succeed.
    pub fn diagnostic(&self) -> Option<String> {
        match &self.state {
            JobState::Failed(reason) => Some(reason.clone()),
            JobState::Cancelled => Some(STOPPED_DIAGNOSTIC.to_string()),
            JobState::SkippedDueToCancellation => Some(SKIPPED_DIAGNOSTIC.to_string()),
            _ => None,
        }
    }
}
