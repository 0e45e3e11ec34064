//! The control loop: drives the pipeline job by job, polls the
//! scheduler, and applies the retry policy.
//!
//! The supervisor is the single writer of the work-package store. All
//! state mutation happens on this task; the only suspension points are
//! the poll ticks, the fixed delay between submission retries, and the
//! scheduler calls themselves - each of which returns promptly on abort.

use camino::Utf8Path;
use drover_config::{ConfigError, JobSpec, PipelineSpec};
use drover_core::{
    ArrayJobId, ExternalId, JobCounts, Notifier, Resources, RunSummary, Scheduler,
    SchedulerError, SubmitRequest, TaskState, TransitionError, WorkError, WorkPackage, WorkState,
};
use drover_params::{expand_job, partition};
use drover_store::{RunPaths, StoreError, WorkStore};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Attempts for one bucket submission before its packages fail.
const SUBMIT_ATTEMPTS: u32 = 3;
/// Fixed delay between submission attempts.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// How much of a worker's stderr file is captured on failure.
const STDERR_TAIL_BYTES: u64 = 2048;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("work-package state error: {0}")]
    Transition(#[from] TransitionError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whole-run result for the caller's exit-code mapping.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub aborted: bool,
    pub summary: RunSummary,
}

enum JobOutcome {
    Settled(JobCounts),
    Aborted,
}

/// One bucket's live submission state.
struct ActiveBucket {
    name: String,
    resources: Resources,
    packages: Vec<WorkPackage>,
    /// Current array job, until every task of this submission settles.
    array: Option<ArrayJobId>,
    /// task_id of the current submission -> index into `packages`.
    outstanding: BTreeMap<u32, usize>,
    /// Deadline for resubmitting the RETRYABLE cohort.
    retry_at: Option<Instant>,
}

impl ActiveBucket {
    fn fresh(bucket: drover_params::Bucket) -> Self {
        Self {
            name: bucket.name,
            resources: bucket.resources,
            packages: bucket.packages,
            array: None,
            outstanding: BTreeMap::new(),
            retry_at: None,
        }
    }

    fn done(&self) -> bool {
        self.packages.iter().all(|wp| wp.state.is_terminal())
    }

    fn indices_in(&self, state: WorkState) -> Vec<usize> {
        self.packages
            .iter()
            .enumerate()
            .filter(|(_, wp)| wp.state == state)
            .map(|(i, _)| i)
            .collect()
    }
}

pub struct Supervisor<S, N> {
    spec: PipelineSpec,
    run: RunPaths,
    store: WorkStore,
    sched: S,
    notifier: N,
    abort: watch::Receiver<bool>,
}

impl<S: Scheduler, N: Notifier> Supervisor<S, N> {
    /// The abort sender must outlive the supervisor; dropping it
    /// disables signal-driven aborts (the marker file still works).
    pub fn new(
        spec: PipelineSpec,
        run: RunPaths,
        sched: S,
        notifier: N,
        abort: watch::Receiver<bool>,
    ) -> Result<Self, SupervisorError> {
        let store = WorkStore::new(&run)?;
        Ok(Self {
            spec,
            run,
            store,
            sched,
            notifier,
            abort,
        })
    }

    /// Drive the pipeline to completion.
    ///
    /// Jobs run strictly in config order. A job whose packages already
    /// exist in the store is resumed (restart recovery); anything else
    /// is expanded, partitioned, and submitted fresh.
    pub async fn run(&mut self) -> Result<RunOutcome, SupervisorError> {
        let jobs = self.spec.jobs.clone();
        self.notifier
            .pipeline_started(self.run.run_id(), jobs.len())
            .await;

        let mut aborted = false;
        for job in &jobs {
            if self.abort_requested() {
                aborted = true;
                break;
            }

            let existing = self.store.packages(&job.name)?;
            let buckets = if existing.is_empty() {
                // Expansion errors are fatal for this job only; store
                // and partitioning errors abort the whole run.
                let records = match expand_job(job) {
                    Ok(records) => records,
                    Err(error) => {
                        tracing::error!(job = %job.name, %error, "parameter expansion failed");
                        self.notifier
                            .error(&format!("job {}: {error}", job.name))
                            .await;
                        continue;
                    }
                };
                self.plan_job(job, records)?
            } else {
                self.rebuild_buckets(existing).await?
            };

            if buckets.iter().all(ActiveBucket::done) {
                continue;
            }

            match self.run_job(job, buckets).await? {
                JobOutcome::Aborted => {
                    aborted = true;
                    break;
                }
                JobOutcome::Settled(counts) => {
                    self.notifier.job_completed(&job.name, &counts).await;
                    if self.spec.properties.halt_on_failure && counts.failed > 0 {
                        self.notifier
                            .error(&format!(
                                "job {} settled with {} failed packages, halting",
                                job.name, counts.failed
                            ))
                            .await;
                        break;
                    }
                }
            }
        }

        let summary = self.summary(aborted)?;
        self.notifier.pipeline_completed(&summary).await;
        Ok(RunOutcome { aborted, summary })
    }

    /// Partition a job's expanded records, persisting every package as
    /// PENDING before anything is submitted.
    fn plan_job(
        &self,
        job: &JobSpec,
        records: Vec<serde_json::Value>,
    ) -> Result<Vec<ActiveBucket>, SupervisorError> {
        let buckets = partition(job, records)?;
        for bucket in &buckets {
            self.store.persist_bucket(&bucket.name, &bucket.packages)?;
        }
        Ok(buckets.into_iter().map(ActiveBucket::fresh).collect())
    }

    /// Reconstruct bucket state from the store after a restart.
    ///
    /// In-flight packages are reconciled against the scheduler: arrays
    /// it still reports stay outstanding; anything it has forgotten
    /// becomes a synthetic failure subject to the normal retry policy.
    async fn rebuild_buckets(
        &mut self,
        existing: Vec<WorkPackage>,
    ) -> Result<Vec<ActiveBucket>, SupervisorError> {
        let mut by_bucket: BTreeMap<String, Vec<WorkPackage>> = BTreeMap::new();
        for wp in existing {
            by_bucket.entry(wp.job_name.clone()).or_default().push(wp);
        }

        let active = match self
            .sched
            .list_active(self.spec.properties.account.as_deref(), self.run.run_id())
            .await
        {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(%error, "list_active failed, relying on per-array queries");
                Vec::new()
            }
        };

        let max_retries = self.spec.properties.max_retries;
        let mut buckets = Vec::with_capacity(by_bucket.len());
        for (name, mut packages) in by_bucket {
            packages.sort_by_key(|wp| wp.index);

            let mut array = None;
            let mut outstanding = BTreeMap::new();
            for idx in 0..packages.len() {
                let wp = &packages[idx];
                if !matches!(wp.state, WorkState::Submitted | WorkState::Running) {
                    continue;
                }
                let Some(external) = wp.external.clone() else {
                    // Submitted without an assignment: the crash hit
                    // between submission and persist. Re-query is
                    // impossible, so fail it into the retry policy.
                    packages[idx].record_failure(WorkError::forgotten(), max_retries)?;
                    continue;
                };

                let id = ArrayJobId(external.array_job_id.clone());
                if active.contains(&id) {
                    array = Some(id);
                    outstanding.insert(external.task_id, idx);
                    continue;
                }

                // Not in the live set: one direct query decides.
                match self.sched.query(&id).await {
                    Ok(states) => match states.get(&external.task_id) {
                        Some(TaskState::Succeeded) => packages[idx].mark_succeeded()?,
                        Some(TaskState::Failed { exit_code }) => {
                            let error = self.failure_detail(&packages[idx], *exit_code);
                            packages[idx].record_failure(error, max_retries)?;
                        }
                        Some(TaskState::Pending | TaskState::Running) => {
                            array = Some(id);
                            outstanding.insert(external.task_id, idx);
                        }
                        None => {
                            packages[idx].record_failure(WorkError::forgotten(), max_retries)?;
                        }
                    },
                    Err(error) => {
                        tracing::warn!(%error, array_job_id = %id, "reconciliation query failed");
                        packages[idx].record_failure(WorkError::forgotten(), max_retries)?;
                    }
                }
            }

            self.store.persist_bucket(&name, &packages)?;

            let resources = packages[0].resources.clone();
            let retry_at = if array.is_none()
                && packages.iter().any(|wp| wp.state == WorkState::Retryable)
            {
                Some(Instant::now())
            } else {
                None
            };
            buckets.push(ActiveBucket {
                name,
                resources,
                packages,
                array,
                outstanding,
                retry_at,
            });
        }

        Ok(buckets)
    }

    /// Run one job's buckets to settlement.
    async fn run_job(
        &mut self,
        job: &JobSpec,
        mut buckets: Vec<ActiveBucket>,
    ) -> Result<JobOutcome, SupervisorError> {
        let total: usize = buckets.iter().map(|b| b.packages.len()).sum();
        self.notifier.job_started(&job.name, total).await;

        // Initial submissions.
        for bucket in buckets.iter_mut() {
            let pending = bucket.indices_in(WorkState::Pending);
            if !pending.is_empty() {
                self.submit_cohort(job, bucket, pending).await?;
            }
            if self.abort_requested() {
                self.abort_job(&mut buckets).await?;
                return Ok(JobOutcome::Aborted);
            }
        }

        let mut ticker = tokio::time::interval(self.spec.properties.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if buckets.iter().all(ActiveBucket::done) {
                break;
            }

            let mut abort_rx = self.abort.clone();
            tokio::select! {
                _ = wait_abort(&mut abort_rx) => {
                    self.abort_job(&mut buckets).await?;
                    return Ok(JobOutcome::Aborted);
                }
                _ = ticker.tick() => {
                    if self.abort_requested() {
                        self.abort_job(&mut buckets).await?;
                        return Ok(JobOutcome::Aborted);
                    }
                    for i in 0..buckets.len() {
                        self.step_bucket(job, &mut buckets[i]).await?;
                    }
                }
            }
        }

        let counts = JobCounts::from_packages(buckets.iter().flat_map(|b| &b.packages));
        Ok(JobOutcome::Settled(counts))
    }

    /// One poll-tick's worth of work for one bucket: due retries,
    /// query, transitions, settlement.
    async fn step_bucket(
        &mut self,
        job: &JobSpec,
        bucket: &mut ActiveBucket,
    ) -> Result<(), SupervisorError> {
        if let Some(at) = bucket.retry_at {
            if Instant::now() >= at {
                bucket.retry_at = None;
                let cohort = bucket.indices_in(WorkState::Retryable);
                if !cohort.is_empty() {
                    self.submit_cohort(job, bucket, cohort).await?;
                }
            }
            return Ok(());
        }

        let Some(array) = bucket.array.clone() else {
            return Ok(());
        };

        if !bucket.outstanding.is_empty() {
            match self.sched.query(&array).await {
                Err(error) => {
                    // No information; re-query on the next tick.
                    tracing::warn!(bucket = %bucket.name, %error, "query failed, no state change");
                    return Ok(());
                }
                Ok(states) => {
                    let mut changed = false;
                    let outstanding: Vec<(u32, usize)> =
                        bucket.outstanding.iter().map(|(t, i)| (*t, *i)).collect();
                    for (task_id, idx) in outstanding {
                        match states.get(&task_id) {
                            None | Some(TaskState::Pending) => {}
                            Some(TaskState::Running) => {
                                if bucket.packages[idx].state == WorkState::Submitted {
                                    bucket.packages[idx].mark_running()?;
                                    changed = true;
                                }
                            }
                            Some(TaskState::Succeeded) => {
                                bucket.packages[idx].mark_succeeded()?;
                                bucket.outstanding.remove(&task_id);
                                changed = true;
                            }
                            Some(TaskState::Failed { exit_code }) => {
                                let error =
                                    self.failure_detail(&bucket.packages[idx], *exit_code);
                                bucket.packages[idx]
                                    .record_failure(error, self.spec.properties.max_retries)?;
                                bucket.outstanding.remove(&task_id);
                                changed = true;
                            }
                        }
                    }
                    if changed {
                        self.store.persist_bucket(&bucket.name, &bucket.packages)?;
                    }
                }
            }
        }

        // Settlement: every task of this submission has reported.
        if bucket.outstanding.is_empty() {
            bucket.array = None;
            let retryable = bucket.indices_in(WorkState::Retryable);
            if !retryable.is_empty() {
                let attempt = retryable
                    .iter()
                    .map(|&i| bucket.packages[i].attempt)
                    .max()
                    .unwrap_or(1)
                    .max(1);
                let delay = backoff_delay(
                    self.spec.properties.poll_interval(),
                    self.spec.properties.exp_backoff_factor,
                    attempt,
                );
                tracing::info!(
                    bucket = %bucket.name,
                    packages = retryable.len(),
                    delay_secs = delay.as_secs_f64(),
                    "scheduling retry submission"
                );
                bucket.retry_at = Some(Instant::now() + delay);
            }
        }

        Ok(())
    }

    /// Submit one cohort of a bucket's packages as a fresh array.
    ///
    /// Submission errors are retried a fixed number of times with a
    /// fixed delay; exhausting them fails the whole cohort.
    async fn submit_cohort(
        &mut self,
        job: &JobSpec,
        bucket: &mut ActiveBucket,
        cohort: Vec<usize>,
    ) -> Result<(), SupervisorError> {
        let request = SubmitRequest {
            name: format!("{}.{}", self.run.run_id(), bucket.name),
            script: job.script.clone(),
            conda_env: self
                .spec
                .properties
                .conda_env
                .clone()
                .unwrap_or_default(),
            records: cohort
                .iter()
                .map(|&i| bucket.packages[i].params.clone())
                .collect(),
            work_dir: self.run.work_dir(),
            log_dir: job.log_dir.clone(),
            resources: bucket.resources.clone(),
            account: self.spec.properties.account.clone(),
        };

        let mut submitted = None;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.sched.submit_array(&request).await {
                Ok(id) => {
                    submitted = Some(id);
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        bucket = %bucket.name,
                        attempt,
                        %error,
                        "submission failed"
                    );
                    if attempt == SUBMIT_ATTEMPTS {
                        break;
                    }
                    let mut abort_rx = self.abort.clone();
                    tokio::select! {
                        _ = wait_abort(&mut abort_rx) => return Ok(()),
                        _ = tokio::time::sleep(SUBMIT_RETRY_DELAY) => {}
                    }
                }
            }
        }

        match submitted {
            Some(id) => {
                bucket.outstanding.clear();
                for (task_id, &idx) in cohort.iter().enumerate() {
                    let external = ExternalId::new(id.as_str(), task_id as u32);
                    bucket.packages[idx].mark_submitted(external, &job.log_dir)?;
                    bucket.outstanding.insert(task_id as u32, idx);
                }
                bucket.array = Some(id);
            }
            None => {
                let message = format!(
                    "bucket {}: submission failed after {SUBMIT_ATTEMPTS} attempts",
                    bucket.name
                );
                for &idx in &cohort {
                    bucket.packages[idx].last_error = Some(WorkError::from_exit(-1));
                    bucket.packages[idx].transition(WorkState::Failed)?;
                }
                self.notifier.error(&message).await;
            }
        }

        self.store.persist_bucket(&bucket.name, &bucket.packages)?;
        Ok(())
    }

    /// Cancel everything outstanding, mark non-terminal packages
    /// CANCELLED, and persist. Terminal packages are untouched.
    async fn abort_job(&mut self, buckets: &mut [ActiveBucket]) -> Result<(), SupervisorError> {
        for bucket in buckets.iter_mut() {
            if let Some(array) = &bucket.array {
                if let Err(error) = self.sched.cancel(array, None).await {
                    tracing::warn!(bucket = %bucket.name, %error, "cancel failed");
                }
            }
            for wp in bucket.packages.iter_mut() {
                if !wp.state.is_terminal() {
                    wp.mark_cancelled()?;
                }
            }
            bucket.outstanding.clear();
            bucket.array = None;
            self.store.persist_bucket(&bucket.name, &bucket.packages)?;
        }
        tracing::info!("abort complete, outstanding submissions cancelled");
        Ok(())
    }

    fn abort_requested(&self) -> bool {
        *self.abort.borrow() || self.run.abort_marker().exists()
    }

    /// Failure detail for a package: scheduler exit code plus the tail
    /// of its stderr file when readable.
    fn failure_detail(&self, wp: &WorkPackage, exit_code: i32) -> WorkError {
        let stderr_tail = wp
            .log_paths
            .as_ref()
            .and_then(|paths| read_tail(&paths.stderr, STDERR_TAIL_BYTES));
        WorkError {
            exit_code,
            stderr_tail,
        }
    }

    fn summary(&self, aborted: bool) -> Result<RunSummary, SupervisorError> {
        let snapshot = self.store.snapshot()?;
        let counts = JobCounts::from_packages(&snapshot);
        Ok(RunSummary {
            jobs: self.spec.jobs.len(),
            packages: snapshot.len(),
            succeeded: counts.succeeded,
            failed: counts.failed,
            cancelled: counts.cancelled,
            aborted,
        })
    }
}

/// Resolves when an abort is signalled; never resolves if the sender is
/// gone (the marker file remains as the abort path).
async fn wait_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Retry delay: `poll_interval * factor^(attempt - 1)`.
fn backoff_delay(poll_interval: Duration, factor: f64, attempt: u32) -> Duration {
    poll_interval.mul_f64(factor.powi(attempt.saturating_sub(1) as i32))
}

/// Reopen every FAILED package for a `retry` invocation. Returns how
/// many were reset.
pub fn reset_failed(store: &WorkStore) -> Result<usize, StoreError> {
    let snapshot = store.snapshot()?;
    let mut by_bucket: BTreeMap<String, Vec<WorkPackage>> = BTreeMap::new();
    for wp in snapshot {
        by_bucket.entry(wp.job_name.clone()).or_default().push(wp);
    }

    let mut reset = 0;
    for (bucket, mut packages) in by_bucket {
        let failed = packages
            .iter()
            .filter(|wp| wp.state == WorkState::Failed)
            .count();
        if failed == 0 {
            continue;
        }
        for wp in packages.iter_mut() {
            if wp.state == WorkState::Failed {
                wp.reset_for_retry();
                reset += 1;
            }
        }
        store.persist_bucket(&bucket, &packages)?;
    }
    Ok(reset)
}

/// Last `limit` bytes of a file, trimmed to whole lines.
fn read_tail(path: &Utf8Path, limit: u64) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(limit);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buffer = String::new();
    file.read_to_string(&mut buffer).ok()?;
    if buffer.is_empty() {
        return None;
    }
    if start > 0 {
        // Drop the first partial line.
        if let Some(pos) = buffer.find('\n') {
            buffer.drain(..=pos);
        }
    }
    Some(buffer.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let poll = Duration::from_secs(1);
        assert_eq!(backoff_delay(poll, 4.0, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(poll, 4.0, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(poll, 4.0, 3), Duration::from_secs(16));
        // Factor 1 keeps the delay flat.
        assert_eq!(backoff_delay(poll, 1.0, 5), Duration::from_secs(1));
    }

    #[test]
    fn test_read_tail_trims_partial_lines() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(temp.path().join("err.log")).unwrap();
        fs::write(&path, "first line\nsecond line\nthird line\n").unwrap();

        let tail = read_tail(&path, 18).unwrap();
        assert_eq!(tail, "third line");

        let all = read_tail(&path, 4096).unwrap();
        assert!(all.starts_with("first line"));
    }
}
