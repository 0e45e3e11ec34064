//! The production scheduler: sbatch/sacct/scancel/squeue choreography.

use crate::sacct::{SACCT_FORMAT, parse_sacct_tasks, parse_squeue_active};
use camino::{Utf8Path, Utf8PathBuf};
use drover_core::{ArrayJobId, Scheduler, SchedulerError, SubmitRequest, TaskState};
use drover_parsers::{CommandError, format_duration_hms, run_command_deadline};
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;

/// Versioned launcher asset; written into the run directory on startup
/// so the submitted script survives upgrades of the drover binary.
const LAUNCHER: &str = include_str!("../assets/launcher.sh");

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

pub struct SlurmScheduler {
    launcher: Utf8PathBuf,
    deadline: Duration,
    seq: AtomicU64,
}

impl SlurmScheduler {
    /// Materialize the launcher under `run_root` and return the adapter.
    pub fn new(run_root: &Utf8Path) -> Result<Self, SchedulerError> {
        fs::create_dir_all(run_root)?;
        let launcher = run_root.join("launcher.sh");
        fs::write(&launcher, LAUNCHER)?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&launcher, Permissions::from_mode(0o755))?;
        }
        Ok(Self {
            launcher,
            deadline: DEFAULT_DEADLINE,
            seq: AtomicU64::new(0),
        })
    }

    fn submit_error(error: CommandError) -> SchedulerError {
        match error {
            CommandError::Timeout { command, seconds } => {
                SchedulerError::Timeout { command, seconds }
            }
            other => SchedulerError::Submit(other.to_string()),
        }
    }

    fn query_error(error: CommandError) -> SchedulerError {
        match error {
            CommandError::Timeout { command, seconds } => {
                SchedulerError::Timeout { command, seconds }
            }
            other => SchedulerError::Query(other.to_string()),
        }
    }
}

/// Argument list for one `sbatch` submission.
fn sbatch_args(request: &SubmitRequest, launcher: &Utf8Path, work_file: &Utf8Path) -> Vec<String> {
    let mut args = vec![
        "--parsable".to_string(),
        format!("--job-name={}", request.name),
        format!("--array=0-{}", request.array_len().saturating_sub(1)),
        format!("--cpus-per-task={}", request.resources.cpus),
        format!("--time={}", format_duration_hms(request.resources.time)),
        "-o".to_string(),
        request.log_dir.join("%A_%a.stdout").to_string(),
        "-e".to_string(),
        request.log_dir.join("%A_%a.stderr").to_string(),
    ];
    if let Some(memory) = &request.resources.memory {
        args.push(format!("--mem={memory}"));
    }
    if let Some(account) = &request.account {
        args.push(format!("--account={account}"));
    }
    args.push(launcher.to_string());
    args.push(request.conda_env.clone());
    args.push(request.script.to_string());
    args.push(work_file.to_string());
    args
}

impl Scheduler for SlurmScheduler {
    async fn submit_array(&self, request: &SubmitRequest) -> Result<ArrayJobId, SchedulerError> {
        if request.records.is_empty() {
            return Err(SchedulerError::Submit(format!(
                "bucket {} has no records",
                request.name
            )));
        }

        fs::create_dir_all(&request.work_dir)?;
        fs::create_dir_all(&request.log_dir)?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let work_file = request.work_dir.join(format!("{}-{seq}.json", request.name));
        fs::write(&work_file, serde_json::to_vec_pretty(&request.records)?)?;

        let args = sbatch_args(request, &self.launcher, &work_file);
        let mut cmd = Command::new("sbatch");
        cmd.args(&args);

        let stdout = run_command_deadline(&mut cmd, "sbatch", self.deadline)
            .await
            .map_err(Self::submit_error)?;

        // --parsable prints "<job_id>" or "<job_id>;<cluster>".
        let job_id = stdout
            .lines()
            .next()
            .and_then(|line| line.trim().split(';').next())
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| {
                SchedulerError::Submit(format!("sbatch did not return a job id: {stdout:?}"))
            })?;

        tracing::info!(
            bucket = %request.name,
            array_job_id = job_id,
            tasks = request.array_len(),
            "submitted array job"
        );
        Ok(ArrayJobId(job_id.to_string()))
    }

    async fn query(&self, id: &ArrayJobId) -> Result<BTreeMap<u32, TaskState>, SchedulerError> {
        let mut cmd = Command::new("sacct");
        cmd.args([
            "-j",
            id.as_str(),
            "-X",
            "--parsable2",
            "--noheader",
            "--format",
            SACCT_FORMAT,
        ]);

        let stdout = run_command_deadline(&mut cmd, "sacct", self.deadline)
            .await
            .map_err(Self::query_error)?;

        parse_sacct_tasks(id.as_str(), &stdout)
            .map_err(|e| SchedulerError::Query(e.to_string()))
    }

    async fn cancel(
        &self,
        id: &ArrayJobId,
        task_ids: Option<&[u32]>,
    ) -> Result<(), SchedulerError> {
        let mut cmd = Command::new("scancel");
        match task_ids {
            Some(tasks) => {
                cmd.args(tasks.iter().map(|t| format!("{id}_{t}")));
            }
            None => {
                cmd.arg(id.as_str());
            }
        }

        run_command_deadline(&mut cmd, "scancel", self.deadline)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                CommandError::Timeout { command, seconds } => {
                    SchedulerError::Timeout { command, seconds }
                }
                other => SchedulerError::Cancel(other.to_string()),
            })
    }

    async fn list_active(
        &self,
        account: Option<&str>,
        name_prefix: &str,
    ) -> Result<Vec<ArrayJobId>, SchedulerError> {
        let mut cmd = Command::new("squeue");
        cmd.args(["-h", "-o", "%i|%j"]);
        if let Some(account) = account {
            cmd.args(["-A", account]);
        }

        let stdout = run_command_deadline(&mut cmd, "squeue", self.deadline)
            .await
            .map_err(Self::query_error)?;

        Ok(parse_squeue_active(&stdout)
            .into_iter()
            .filter(|(_, name)| name.starts_with(name_prefix))
            .map(|(id, _)| ArrayJobId(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::Resources;
    use serde_json::json;

    fn request() -> SubmitRequest {
        SubmitRequest {
            name: "run-1.align".to_string(),
            script: "/pipeline/align.py".into(),
            conda_env: "/envs/pipeline".to_string(),
            records: vec![json!({"s": 1}), json!({"s": 2}), json!({"s": 3})],
            work_dir: "/runs/run-1/work".into(),
            log_dir: "/runs/run-1/logs".into(),
            resources: Resources {
                cpus: 4,
                time: Duration::from_secs(2 * 3600),
                memory: Some("8G".to_string()),
            },
            account: Some("geo".to_string()),
        }
    }

    #[test]
    fn test_sbatch_args_cover_the_contract() {
        let req = request();
        let args = sbatch_args(
            &req,
            Utf8Path::new("/runs/run-1/launcher.sh"),
            Utf8Path::new("/runs/run-1/work/run-1.align-0.json"),
        );

        assert!(args.contains(&"--array=0-2".to_string()));
        assert!(args.contains(&"--cpus-per-task=4".to_string()));
        assert!(args.contains(&"--time=02:00:00".to_string()));
        assert!(args.contains(&"--mem=8G".to_string()));
        assert!(args.contains(&"--account=geo".to_string()));
        assert!(args.contains(&"/runs/run-1/logs/%A_%a.stdout".to_string()));

        // Launcher positional contract: env, script, work file.
        let tail: Vec<_> = args.iter().rev().take(4).rev().collect();
        assert_eq!(tail[0], "/runs/run-1/launcher.sh");
        assert_eq!(tail[1], "/envs/pipeline");
        assert_eq!(tail[2], "/pipeline/align.py");
        assert_eq!(tail[3], "/runs/run-1/work/run-1.align-0.json");
    }

    #[test]
    fn test_single_record_still_gets_an_array() {
        let mut req = request();
        req.records.truncate(1);
        let args = sbatch_args(&req, Utf8Path::new("/l"), Utf8Path::new("/w"));
        assert!(args.contains(&"--array=0-0".to_string()));
    }

    #[test]
    fn test_launcher_asset_honors_task_env_contract() {
        assert!(LAUNCHER.contains("SLURM_ARRAY_TASK_ID"));
        assert!(LAUNCHER.contains("ARRAY_TASK_ID"));
        assert!(LAUNCHER.contains(".failed"));
    }
}
