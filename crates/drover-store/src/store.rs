//! Per-bucket JSON persistence of work packages.

use crate::run::RunPaths;
use crate::StoreError;
use camino::Utf8PathBuf;
use drover_core::WorkPackage;
use std::fs::{self, File};
use std::io::Write;

/// Durable mapping from `(job_name, index)` to work-package state.
///
/// One JSON file per bucket. Persists are write-through: serialize to a
/// sibling temp file, fsync, rename over the old version.
pub struct WorkStore {
    state_dir: Utf8PathBuf,
}

impl WorkStore {
    pub fn new(run: &RunPaths) -> Result<Self, StoreError> {
        let state_dir = run.state_dir();
        fs::create_dir_all(&state_dir)?;
        Ok(Self { state_dir })
    }

    fn bucket_path(&self, bucket: &str) -> Utf8PathBuf {
        self.state_dir.join(format!("{bucket}.json"))
    }

    /// Write-through persist of one bucket's packages.
    pub fn persist_bucket(
        &self,
        bucket: &str,
        packages: &[WorkPackage],
    ) -> Result<(), StoreError> {
        let path = self.bucket_path(bucket);
        let tmp = self.state_dir.join(format!("{bucket}.json.tmp"));

        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(packages)?)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// All packages of one bucket, in index order. An absent file is an
    /// empty bucket.
    pub fn load_bucket(&self, bucket: &str) -> Result<Vec<WorkPackage>, StoreError> {
        let path = self.bucket_path(bucket);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut packages: Vec<WorkPackage> = serde_json::from_str(&content)?;
        packages.sort_by_key(|wp| wp.index);
        Ok(packages)
    }

    /// Consistent read of the entire store, ordered by bucket name then
    /// index. A bucket file that no longer parses is skipped with a
    /// warning; its packages are re-queried against the scheduler on
    /// reconciliation.
    pub fn snapshot(&self) -> Result<Vec<WorkPackage>, StoreError> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(bucket) = name.strip_suffix(".json") {
                names.push(bucket.to_string());
            }
        }
        names.sort();

        let mut packages = Vec::new();
        for bucket in names {
            match self.load_bucket(&bucket) {
                Ok(bucket_packages) => packages.extend(bucket_packages),
                Err(error) => {
                    tracing::warn!(%bucket, %error, "skipping unreadable bucket file");
                }
            }
        }
        Ok(packages)
    }

    /// All packages whose bucket belongs to `job` (the base job name or
    /// a full bucket name).
    pub fn packages(&self, job: &str) -> Result<Vec<WorkPackage>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|wp| wp.base_job == job || wp.job_name == job)
            .collect())
    }

    /// Reverse lookup for poll reconciliation.
    pub fn by_external(
        &self,
        array_job_id: &str,
        task_id: u32,
    ) -> Result<Option<WorkPackage>, StoreError> {
        Ok(self.snapshot()?.into_iter().find(|wp| {
            wp.external
                .as_ref()
                .is_some_and(|ext| ext.array_job_id == array_job_id && ext.task_id == task_id)
        }))
    }
}
