//! Resource-bucket partitioning via special-case predicates.

use camino::Utf8PathBuf;
use drover_config::{ConfigError, FileConstraint, JobSpec, SpecialCase};
use drover_core::{Resources, WorkPackage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fs;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// A group of work packages sharing a resource request, submitted
/// together as one array job.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// `<job>` for the default bucket, `<job>.<case>` for special cases.
    pub name: String,
    pub resources: Resources,
    pub packages: Vec<WorkPackage>,
}

impl Bucket {
    fn new(name: String, resources: Resources) -> Self {
        Self {
            name,
            resources,
            packages: Vec::new(),
        }
    }

    fn push(&mut self, base_job: &str, params: Value) {
        let index = self.packages.len() as u32;
        self.packages.push(WorkPackage::new(
            self.name.clone(),
            base_job,
            index,
            params,
            self.resources.clone(),
        ));
    }
}

/// Assign each expanded record to at most one bucket.
///
/// Special cases are evaluated in config order and the first match
/// claims the record; everything else falls to the default bucket.
/// Buckets that claim nothing are dropped. Within a bucket, array
/// indices follow the expanded-sequence order.
pub fn partition(job: &JobSpec, records: Vec<Value>) -> Result<Vec<Bucket>, ConfigError> {
    let mut default = Bucket::new(job.name.clone(), job.resources.to_resources()?);
    let mut special: Vec<Bucket> = job
        .special_cases
        .iter()
        .map(|case| Ok(Bucket::new(job.bucket_name(case), case.resources.to_resources()?)))
        .collect::<Result<_, ConfigError>>()?;

    for record in records {
        let claimed = job
            .special_cases
            .iter()
            .position(|case| predicate_matches(&job.name, case, &record));
        match claimed {
            Some(i) => special[i].push(&job.name, record),
            None => default.push(&job.name, record),
        }
    }

    let mut buckets = Vec::with_capacity(special.len() + 1);
    if !default.packages.is_empty() {
        buckets.push(default);
    }
    buckets.extend(special.into_iter().filter(|b| !b.packages.is_empty()));
    Ok(buckets)
}

/// A predicate holds when every listed file exists under the record's
/// data directory and satisfies its size constraints. Anything
/// unreadable makes the match conservatively false.
fn predicate_matches(job: &str, case: &SpecialCase, record: &Value) -> bool {
    let Some(data_dir) = record.get("data_dir").and_then(Value::as_str) else {
        tracing::warn!(
            job,
            case = %case.name,
            "record has no data_dir parameter, special case cannot match"
        );
        return false;
    };

    case.files
        .iter()
        .all(|constraint| constraint_holds(job, case, data_dir, constraint, record))
}

fn constraint_holds(
    job: &str,
    case: &SpecialCase,
    data_dir: &str,
    constraint: &FileConstraint,
    record: &Value,
) -> bool {
    let rendered = render_path(&constraint.path, record);
    let path = Utf8PathBuf::from(data_dir).join(&rendered);

    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(
                job,
                case = %case.name,
                %path,
                %error,
                "cannot stat predicate file, treating as no match"
            );
            return false;
        }
    };

    let size = metadata.len();
    if constraint.size_max.is_some_and(|max| size > max) {
        return false;
    }
    if constraint.size_min.is_some_and(|min| size < min) {
        return false;
    }
    true
}

/// Substitute `{param}` placeholders in a predicate path from the
/// record. Unknown placeholders are left as-is (and will then fail the
/// stat, i.e. no match).
fn render_path(template: &str, record: &Value) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match record.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use serde_json::json;
    use tempfile::TempDir;

    fn job_with_case(files: Vec<FileConstraint>) -> JobSpec {
        let yaml = r#"
name: feature-engineering
script: features.py
param_files: [cities.yml]
log_dir: logs
resources: { cpus: 8, time: "04:00:00" }
special_cases:
  - name: small-cities
    files:
      - { path: "geom.csv" }
    resources: { cpus: 1, time: "00:30:00" }
"#;
        let mut job: JobSpec = serde_yaml::from_str(yaml).unwrap();
        job.special_cases[0].files = files;
        job
    }

    fn city_record(root: &Utf8Path, name: &str, geom_size: usize) -> Value {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("geom.csv"), vec![b'x'; geom_size]).unwrap();
        json!({ "city": name, "data_dir": dir.as_str() })
    }

    #[test]
    fn test_size_predicate_splits_buckets() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let job = job_with_case(vec![FileConstraint {
            path: "geom.csv".to_string(),
            size_max: Some(20_000),
            size_min: None,
        }]);

        let records = vec![
            city_record(root, "bonn", 10_000),
            city_record(root, "berlin", 50_000),
            city_record(root, "mainz", 10_000),
        ];
        let buckets = partition(&job, records).unwrap();
        assert_eq!(buckets.len(), 2);

        let default = buckets.iter().find(|b| b.name == "feature-engineering").unwrap();
        assert_eq!(default.packages.len(), 1);
        assert_eq!(default.packages[0].params["city"], "berlin");
        assert_eq!(default.packages[0].index, 0);
        assert_eq!(default.resources.cpus, 8);

        let small = buckets
            .iter()
            .find(|b| b.name == "feature-engineering.small-cities")
            .unwrap();
        assert_eq!(small.packages.len(), 2);
        // Indices are dense within the bucket, in expanded order.
        assert_eq!(small.packages[0].params["city"], "bonn");
        assert_eq!(small.packages[0].index, 0);
        assert_eq!(small.packages[1].params["city"], "mainz");
        assert_eq!(small.packages[1].index, 1);
        assert_eq!(small.resources.cpus, 1);
    }

    #[test]
    fn test_unmatched_special_case_produces_no_bucket() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let job = job_with_case(vec![FileConstraint {
            path: "geom.csv".to_string(),
            size_max: Some(10),
            size_min: None,
        }]);

        let records = vec![city_record(root, "bonn", 10_000)];
        let buckets = partition(&job, records).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering");
    }

    #[test]
    fn test_missing_file_falls_to_default_bucket() {
        let job = job_with_case(vec![FileConstraint {
            path: "geom.csv".to_string(),
            size_max: None,
            size_min: None,
        }]);

        let records = vec![json!({ "city": "ghost", "data_dir": "/no/such/dir" })];
        let buckets = partition(&job, records).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering");
    }

    #[test]
    fn test_record_without_data_dir_never_matches() {
        let job = job_with_case(vec![FileConstraint {
            path: "geom.csv".to_string(),
            size_max: None,
            size_min: None,
        }]);

        let buckets = partition(&job, vec![json!({ "city": "bonn" })]).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering");
    }

    #[test]
    fn test_placeholder_paths_resolve_from_record() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let dir = root.join("tiles");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("bonn_geom.csv"), b"data").unwrap();

        let job = job_with_case(vec![FileConstraint {
            path: "{city}_geom.csv".to_string(),
            size_max: None,
            size_min: None,
        }]);

        let records = vec![json!({ "city": "bonn", "data_dir": dir.as_str() })];
        let buckets = partition(&job, records).unwrap();
        assert_eq!(buckets[0].name, "feature-engineering.small-cities");
    }

    #[test]
    fn test_first_matching_case_claims_the_record() {
        let temp = TempDir::new().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();

        let yaml = r#"
name: render
script: render.py
param_files: [tiles.yml]
log_dir: logs
resources: { cpus: 2, time: "01:00:00" }
special_cases:
  - name: first
    files: [{ path: "tile.bin" }]
    resources: { cpus: 1, time: "00:10:00" }
  - name: second
    files: [{ path: "tile.bin" }]
    resources: { cpus: 4, time: "02:00:00" }
"#;
        let job: JobSpec = serde_yaml::from_str(yaml).unwrap();
        let dir = root.join("t1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("tile.bin"), b"bits").unwrap();

        let buckets =
            partition(&job, vec![json!({ "data_dir": dir.as_str() })]).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "render.first");
    }
}
