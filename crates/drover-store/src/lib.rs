//! Durable work-package store.
//!
//! The store is the authority on work-package state across supervisor
//! restarts. Each bucket is one small JSON file under the run
//! directory's `state/` subdirectory, replaced atomically and fsynced on
//! every persist, so a crash leaves at most one bucket file in its
//! previous version.

pub mod run;
pub mod store;

pub use run::RunPaths;
pub use store::WorkStore;

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no previous run under {0}")]
    NoPreviousRun(Utf8PathBuf),
}
