//! Work-package types and lifecycle.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Effective resource request for a bucket of work packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPUs per task.
    pub cpus: u32,

    /// Wall-clock limit.
    pub time: Duration,

    /// Memory request in scheduler syntax (e.g. "4G"), if any.
    pub memory: Option<String>,
}

/// Work-package lifecycle state.
///
/// Terminal states (SUCCEEDED, FAILED, CANCELLED) are never transitioned
/// out of within a single pipeline run. RETRYABLE is the holding state
/// between a failed attempt and its backoff resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    Pending,
    Submitted,
    Running,
    Retryable,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkState {
    /// Whether this state is terminal for the current run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the supervisor no longer polls this package within the
    /// current submission (terminal or awaiting resubmission).
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, Self::Retryable)
    }

    /// Legal next states.
    fn may_transition(&self, next: WorkState) -> bool {
        use WorkState::*;
        match self {
            Pending => matches!(next, Submitted | Failed | Cancelled),
            Submitted => matches!(next, Running | Succeeded | Failed | Retryable | Cancelled),
            Running => matches!(next, Succeeded | Failed | Retryable | Cancelled),
            Retryable => matches!(next, Submitted | Failed | Cancelled),
            Succeeded | Failed | Cancelled => false,
        }
    }
}

/// `(array_job_id, task_id)` pair assigned by the scheduler on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
    pub array_job_id: String,
    pub task_id: u32,
}

impl ExternalId {
    pub fn new(array_job_id: impl Into<String>, task_id: u32) -> Self {
        Self {
            array_job_id: array_job_id.into(),
            task_id,
        }
    }

    /// Derive the worker stdout/stderr locations under `log_dir`.
    ///
    /// Naming contract: `<array_job_id>_<task_id>.{stdout,stderr}`.
    pub fn log_paths(&self, log_dir: &Utf8Path) -> LogPaths {
        let stem = format!("{}_{}", self.array_job_id, self.task_id);
        LogPaths {
            stdout: log_dir.join(format!("{stem}.stdout")),
            stderr: log_dir.join(format!("{stem}.stderr")),
        }
    }
}

/// Derived worker log file locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub stdout: Utf8PathBuf,
    pub stderr: Utf8PathBuf,
}

/// Scheduler-reported failure detail for the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkError {
    pub exit_code: i32,
    /// Tail of the worker's stderr file, when readable.
    pub stderr_tail: Option<String>,
}

impl WorkError {
    pub fn from_exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            stderr_tail: None,
        }
    }

    /// Synthetic failure for packages whose external id the scheduler no
    /// longer recognizes after a supervisor restart.
    pub fn forgotten() -> Self {
        Self {
            exit_code: -1,
            stderr_tail: Some("scheduler no longer reports this task".to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal work-package transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: WorkState,
    pub to: WorkState,
}

/// The atomic unit: one invocation of the user script with one parameter
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPackage {
    /// Bucket name: the parent job's name, with an optional
    /// `.special_case` suffix.
    pub job_name: String,

    /// Parent job name without any special-case suffix.
    pub base_job: String,

    /// Dense position within this bucket's array, stable from 0.
    pub index: u32,

    /// Opaque parameter record passed to the user script via stdin.
    pub params: serde_json::Value,

    /// Effective resource request after special-case resolution.
    pub resources: Resources,

    pub state: WorkState,

    /// Count of submission attempts; 0 before the first submit.
    pub attempt: u32,

    /// Scheduler assignment for the current (or last) attempt.
    pub external: Option<ExternalId>,

    pub log_paths: Option<LogPaths>,

    pub last_error: Option<WorkError>,
}

impl WorkPackage {
    pub fn new(
        job_name: impl Into<String>,
        base_job: impl Into<String>,
        index: u32,
        params: serde_json::Value,
        resources: Resources,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            base_job: base_job.into(),
            index,
            params,
            resources,
            state: WorkState::Pending,
            attempt: 0,
            external: None,
            log_paths: None,
            last_error: None,
        }
    }

    /// Apply a state transition, rejecting anything outside the legal
    /// lifecycle.
    pub fn transition(&mut self, next: WorkState) -> Result<(), TransitionError> {
        if !self.state.may_transition(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record a (re)submission: bumps the attempt counter and stores the
    /// scheduler assignment and derived log locations.
    pub fn mark_submitted(
        &mut self,
        external: ExternalId,
        log_dir: &Utf8Path,
    ) -> Result<(), TransitionError> {
        self.transition(WorkState::Submitted)?;
        self.attempt += 1;
        self.log_paths = Some(external.log_paths(log_dir));
        self.external = Some(external);
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkState::Running)
    }

    pub fn mark_succeeded(&mut self) -> Result<(), TransitionError> {
        self.last_error = None;
        self.transition(WorkState::Succeeded)
    }

    /// Record a failed attempt. The package becomes RETRYABLE while
    /// attempts remain (`attempt <= max_retries`), otherwise terminal
    /// FAILED.
    pub fn record_failure(
        &mut self,
        error: WorkError,
        max_retries: u32,
    ) -> Result<(), TransitionError> {
        self.last_error = Some(error);
        if self.attempt <= max_retries {
            self.transition(WorkState::Retryable)
        } else {
            self.transition(WorkState::Failed)
        }
    }

    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkState::Cancelled)
    }

    /// Reopen a FAILED package for a new `retry` invocation.
    ///
    /// Deliberately outside the single-run lifecycle: terminal states are
    /// sticky within a run, and a fresh invocation grants a fresh attempt
    /// budget. `last_error` is kept for the status surface.
    pub fn reset_for_retry(&mut self) {
        self.state = WorkState::Retryable;
        self.attempt = 0;
        self.external = None;
        self.log_paths = None;
    }
}

/// Per-job state counts, as surfaced by `status` and the notifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn from_packages<'a>(packages: impl IntoIterator<Item = &'a WorkPackage>) -> Self {
        let mut counts = Self::default();
        for wp in packages {
            match wp.state {
                WorkState::Pending | WorkState::Submitted | WorkState::Retryable => {
                    counts.pending += 1
                }
                WorkState::Running => counts.running += 1,
                WorkState::Succeeded => counts.succeeded += 1,
                WorkState::Failed => counts.failed += 1,
                WorkState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

impl std::fmt::Display for JobCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending: {}, running: {}, succeeded: {}, failed: {}",
            self.pending, self.running, self.succeeded, self.failed
        )?;
        if self.cancelled > 0 {
            write!(f, ", cancelled: {}", self.cancelled)?;
        }
        Ok(())
    }
}

/// Whole-run outcome handed to the notifier when the pipeline finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub jobs: usize,
    pub packages: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub aborted: bool,
}
