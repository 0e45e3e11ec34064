//! Run-directory layout and the `latest` pointer.

use crate::StoreError;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use std::fs;

/// Layout of one pipeline run under the log root:
///
/// ```text
/// <log_root>/<run_id>/state/   work-package store, one file per bucket
/// <log_root>/<run_id>/work/    generated work files per submission
/// <log_root>/<run_id>/logs/    fallback worker stdout/stderr
/// <log_root>/latest            pointer to the current run_id
/// ```
#[derive(Debug, Clone)]
pub struct RunPaths {
    log_root: Utf8PathBuf,
    run_id: String,
}

impl RunPaths {
    /// Start a fresh run: purge the run the `latest` pointer names (if
    /// any), mint a new run id, create the directory skeleton, and
    /// repoint `latest`.
    pub fn create(log_root: &Utf8Path) -> Result<Self, StoreError> {
        if let Ok(previous) = Self::open_latest(log_root) {
            if previous.root().is_dir() {
                tracing::info!(run_id = previous.run_id(), "purging previous run");
                fs::remove_dir_all(previous.root())?;
            }
        }

        let run_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        );
        let run = Self {
            log_root: log_root.to_path_buf(),
            run_id,
        };
        fs::create_dir_all(run.state_dir())?;
        fs::create_dir_all(run.work_dir())?;
        fs::create_dir_all(run.logs_dir())?;
        fs::write(log_root.join("latest"), &run.run_id)?;
        Ok(run)
    }

    /// Reopen the run the `latest` pointer names (for `retry`, `status`,
    /// `abort` and the log readers).
    pub fn open_latest(log_root: &Utf8Path) -> Result<Self, StoreError> {
        let pointer = log_root.join("latest");
        if !pointer.exists() {
            return Err(StoreError::NoPreviousRun(log_root.to_path_buf()));
        }
        let run_id = fs::read_to_string(&pointer)?.trim().to_string();
        if run_id.is_empty() {
            return Err(StoreError::NoPreviousRun(log_root.to_path_buf()));
        }
        Ok(Self {
            log_root: log_root.to_path_buf(),
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> Utf8PathBuf {
        self.log_root.join(&self.run_id)
    }

    pub fn state_dir(&self) -> Utf8PathBuf {
        self.root().join("state")
    }

    pub fn work_dir(&self) -> Utf8PathBuf {
        self.root().join("work")
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root().join("logs")
    }

    /// Marker file the `abort` command drops for a running supervisor.
    pub fn abort_marker(&self) -> Utf8PathBuf {
        self.root().join("abort")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_open_latest() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();

        let run = RunPaths::create(root).unwrap();
        assert!(run.state_dir().is_dir());
        assert!(run.work_dir().is_dir());

        let reopened = RunPaths::open_latest(root).unwrap();
        assert_eq!(reopened.run_id(), run.run_id());
        assert_eq!(reopened.root(), run.root());
    }

    #[test]
    fn test_open_latest_without_runs_fails() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        assert!(matches!(
            RunPaths::open_latest(root),
            Err(StoreError::NoPreviousRun(_))
        ));
    }

    #[test]
    fn test_create_purges_previous_run() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();

        let first = RunPaths::create(root).unwrap();
        fs::write(first.state_dir().join("align.json"), "[]").unwrap();

        let second = RunPaths::create(root).unwrap();
        assert_ne!(first.run_id(), second.run_id());
        assert!(!first.root().exists());
        assert!(second.state_dir().is_dir());
    }
}
