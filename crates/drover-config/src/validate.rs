//! Pre-submission validation of the pipeline spec.

use crate::spec::{PipelineSpec, ResourcesSpec};
use crate::ConfigError;
use drover_parsers::{is_hms, parse_memory_mb};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

impl PipelineSpec {
    /// Validate the spec against the filesystem and value constraints.
    ///
    /// Any violation is fatal before submission. Call after CLI
    /// overrides have been applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::Invalid("pipeline has no jobs".to_string()));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !NAME_RE.is_match(&job.name) {
                return Err(ConfigError::Invalid(format!(
                    "job name '{}' may only contain letters, digits, '-' and '_'",
                    job.name
                )));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
            if !job.script.exists() {
                return Err(ConfigError::Invalid(format!(
                    "job '{}': script {} does not exist",
                    job.name, job.script
                )));
            }
            if job.param_files.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job '{}': param_files is empty",
                    job.name
                )));
            }
            for file in &job.param_files {
                if !file.exists() {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': param file {} does not exist",
                        job.name, file
                    )));
                }
            }
            validate_resources(&job.name, &job.resources)?;

            let mut case_names = HashSet::new();
            for case in &job.special_cases {
                if !NAME_RE.is_match(&case.name) {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': special case name '{}' may only contain letters, digits, '-' and '_'",
                        job.name, case.name
                    )));
                }
                if !case_names.insert(case.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': duplicate special case '{}'",
                        job.name, case.name
                    )));
                }
                if case.files.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "job '{}': special case '{}' lists no file constraints",
                        job.name, case.name
                    )));
                }
                validate_resources(&format!("{}.{}", job.name, case.name), &case.resources)?;
            }
        }

        let props = &self.properties;
        if props.conda_env.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Invalid(
                "conda_env is not set (config property or -e flag)".to_string(),
            ));
        }
        if props.poll_interval < 1 {
            return Err(ConfigError::Invalid(
                "poll_interval must be at least 1 second".to_string(),
            ));
        }
        if props.exp_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "exp_backoff_factor must be >= 1".to_string(),
            ));
        }
        if let Some(slack) = &props.slack {
            if slack.channel.is_empty() || slack.token.is_empty() {
                return Err(ConfigError::Invalid(
                    "slack.channel and slack.token must both be set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn validate_resources(owner: &str, resources: &ResourcesSpec) -> Result<(), ConfigError> {
    if resources.cpus < 1 {
        return Err(ConfigError::Invalid(format!(
            "'{owner}': cpus must be at least 1"
        )));
    }
    if !is_hms(&resources.time) || resources.time_limit().is_none() {
        return Err(ConfigError::Invalid(format!(
            "'{owner}': time '{}' is not HH:MM:SS",
            resources.time
        )));
    }
    if let Some(memory) = &resources.memory {
        if parse_memory_mb(memory).is_none() {
            return Err(ConfigError::Invalid(format!(
                "'{owner}': memory '{memory}' is not a size like 4G or 4096M"
            )));
        }
    }
    Ok(())
}
