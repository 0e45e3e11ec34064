//! Pipeline specification loading and validation.
//!
//! The configuration is a YAML document with two top-level keys: `jobs`
//! (ordered) and `properties`. Parsing is strict: unknown fields are
//! fatal. Validation runs after CLI overrides are applied and before any
//! submission.

pub mod spec;
mod validate;

pub use spec::{
    FileConstraint, JobSpec, PipelineSpec, Properties, ResourcesSpec, SlackProperties,
    SpecialCase,
};

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
