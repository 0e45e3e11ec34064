//! Pipeline specification schema.

use crate::ConfigError;
use camino::{Utf8Path, Utf8PathBuf};
use drover_core::Resources;
use drover_parsers::parse_duration;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// A validated pipeline definition: ordered jobs plus process-wide
/// properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    pub jobs: Vec<JobSpec>,
    pub properties: Properties,
}

/// One job in the pipeline: a user script fanned out over the records
/// produced by its parameter files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Unique within the pipeline.
    pub name: String,

    /// User script executed once per work package.
    pub script: Utf8PathBuf,

    /// Parameter sources, expanded and concatenated in declared order.
    pub param_files: Vec<Utf8PathBuf>,

    /// Destination for this job's worker stdout/stderr files.
    pub log_dir: Utf8PathBuf,

    pub resources: ResourcesSpec,

    /// Predicate-driven resource overrides, evaluated in declared order.
    #[serde(default)]
    pub special_cases: Vec<SpecialCase>,
}

impl JobSpec {
    /// Bucket name for one of this job's special cases.
    pub fn bucket_name(&self, case: &SpecialCase) -> String {
        format!("{}.{}", self.name, case.name)
    }
}

/// Resource request as written in the config (`time` in `HH:MM:SS`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcesSpec {
    pub cpus: u32,
    pub time: String,
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourcesSpec {
    /// Effective duration of the `time` field; validation guarantees
    /// this parses.
    pub fn time_limit(&self) -> Option<Duration> {
        parse_duration(&self.time)
    }

    pub fn to_resources(&self) -> Result<Resources, ConfigError> {
        let time = self.time_limit().ok_or_else(|| {
            ConfigError::Invalid(format!("unparseable time limit '{}'", self.time))
        })?;
        Ok(Resources {
            cpus: self.cpus,
            time,
            memory: self.memory.clone(),
        })
    }
}

/// Alternative resource allocation applied to records whose input data
/// satisfies every file constraint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialCase {
    /// Suffix appended to the job name to form the bucket name.
    pub name: String,

    /// All constraints must hold for the predicate to match.
    pub files: Vec<FileConstraint>,

    pub resources: ResourcesSpec,
}

/// Required-file specification, resolved against the record's data
/// directory. `path` may contain `{param}` placeholders filled from the
/// record.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConstraint {
    pub path: String,
    #[serde(default)]
    pub size_max: Option<u64>,
    #[serde(default)]
    pub size_min: Option<u64>,
}

/// Process-wide properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Properties {
    /// Conda environment activated by the launcher. Required by the time
    /// the supervisor starts; the CLI may supply it.
    #[serde(default)]
    pub conda_env: Option<String>,

    /// Accounting group passed to the scheduler.
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-package retry budget; 0 means a single attempt.
    #[serde(default)]
    pub max_retries: u32,

    /// Poll period in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Multiplier applied per failed attempt to the retry delay.
    #[serde(default = "default_backoff_factor")]
    pub exp_backoff_factor: f64,

    /// When true, a job that settles with FAILED packages stops the
    /// pipeline instead of merely being reported.
    #[serde(default)]
    pub halt_on_failure: bool,

    #[serde(default)]
    pub slack: Option<SlackProperties>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_backoff_factor() -> f64 {
    1.0
}

impl Properties {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

/// Slack notifier settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackProperties {
    pub channel: String,
    pub token: String,
}

impl PipelineSpec {
    /// Load a pipeline spec from a YAML file. Validation is separate so
    /// CLI overrides can be applied in between.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
