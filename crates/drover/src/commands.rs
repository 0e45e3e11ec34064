//! Store-backed CLI commands: status, work, abort.

use crate::supervisor::SupervisorError;
use camino::Utf8Path;
use drover_config::PipelineSpec;
use drover_core::{ArrayJobId, JobCounts, Scheduler, WorkPackage};
use drover_slurm::SlurmScheduler;
use drover_store::{RunPaths, WorkStore};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

/// Group a snapshot by base job, ordered like the saved config when it
/// is still readable, alphabetically otherwise.
fn by_job(
    run: &RunPaths,
    snapshot: Vec<WorkPackage>,
) -> Vec<(String, Vec<WorkPackage>)> {
    let mut groups: BTreeMap<String, Vec<WorkPackage>> = BTreeMap::new();
    for wp in snapshot {
        groups.entry(wp.base_job.clone()).or_default().push(wp);
    }

    let mut ordered = Vec::with_capacity(groups.len());
    if let Ok(spec) = PipelineSpec::load(&run.root().join("pipeline.yml")) {
        for job in &spec.jobs {
            if let Some(packages) = groups.remove(&job.name) {
                ordered.push((job.name.clone(), packages));
            }
        }
    }
    ordered.extend(groups);
    ordered
}

/// Print per-job work-package counts for the latest run.
pub fn status(log_root: &Utf8Path) -> Result<(), SupervisorError> {
    let run = RunPaths::open_latest(log_root)?;
    let store = WorkStore::new(&run)?;
    let snapshot = store.snapshot()?;

    println!("run: {}", run.run_id());
    println!(
        "{:<40} {:>8} {:>8} {:>10} {:>8}",
        "job", "pending", "running", "succeeded", "failed"
    );
    for (job, packages) in by_job(&run, snapshot) {
        let counts = JobCounts::from_packages(&packages);
        println!(
            "{:<40} {:>8} {:>8} {:>10} {:>8}",
            job, counts.pending, counts.running, counts.succeeded, counts.failed
        );
    }
    Ok(())
}

/// List one job's work packages with state and params.
pub fn work(log_root: &Utf8Path, job: &str) -> Result<(), SupervisorError> {
    let run = RunPaths::open_latest(log_root)?;
    let store = WorkStore::new(&run)?;
    let mut packages = store.packages(job)?;
    packages.sort_by(|a, b| (&a.job_name, a.index).cmp(&(&b.job_name, b.index)));

    for wp in &packages {
        let external = wp
            .external
            .as_ref()
            .map(|e| format!("{}_{}", e.array_job_id, e.task_id))
            .unwrap_or_else(|| "-".to_string());
        let error = wp
            .last_error
            .as_ref()
            .map(|e| format!(" exit={}", e.exit_code))
            .unwrap_or_default();
        println!(
            "{}[{}] {:?} attempt={} external={}{} {}",
            wp.job_name,
            wp.index,
            wp.state,
            wp.attempt,
            external,
            error,
            serde_json::to_string(&wp.params).unwrap_or_default()
        );
    }
    if packages.is_empty() {
        println!("no work packages for job '{job}'");
    }
    Ok(())
}

/// Cancel outstanding submissions. A full abort (`--all`, or no job
/// filter at all) also drops the abort marker so a running supervisor
/// persists, cleans up, and exits; `-j JOB` cancels only that job's
/// buckets and leaves the supervisor polling.
pub async fn abort(
    log_root: &Utf8Path,
    job: Option<&str>,
    all: bool,
) -> Result<(), SupervisorError> {
    // -j and --all are mutually exclusive at the CLI.
    let full = all || job.is_none();
    let run = RunPaths::open_latest(log_root)?;
    let store = WorkStore::new(&run)?;
    let sched = SlurmScheduler::new(&run.root())?;

    let arrays: BTreeSet<String> = store
        .snapshot()?
        .iter()
        .filter(|wp| !wp.state.is_terminal())
        .filter(|wp| job.is_none_or(|j| wp.base_job == j || wp.job_name == j))
        .filter_map(|wp| wp.external.as_ref().map(|e| e.array_job_id.clone()))
        .collect();

    for id in &arrays {
        if let Err(error) = sched.cancel(&ArrayJobId(id.clone()), None).await {
            tracing::warn!(array_job_id = %id, %error, "cancel failed");
        }
    }
    println!("cancelled {} array jobs", arrays.len());

    if full {
        fs::write(run.abort_marker(), "abort")?;
        println!("abort requested; the supervisor will persist and exit");
    }
    Ok(())
}
