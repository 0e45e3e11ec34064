//! The contract the supervisor requires from a workload manager.

use crate::types::Resources;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Scheduler-assigned identifier of a submitted array job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayJobId(pub String);

impl ArrayJobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArrayJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observed state of one task within an array job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed { exit_code: i32 },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// One bucket submission: a batch of tasks sharing a resource request.
///
/// The adapter owns the launcher choreography: it serializes `records`
/// into the work file (a JSON array; task `i` consumes element `i`),
/// dispatches the submission, and points worker stdout/stderr at
/// `log_dir` using the `<array_job_id>_<task_id>.{stdout,stderr}` naming
/// contract.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Scheduler-visible job name (run id prefix + bucket name).
    pub name: String,

    /// User script executed once per task, fed one record via stdin.
    pub script: Utf8PathBuf,

    /// Conda environment activated by the launcher.
    pub conda_env: String,

    /// Parameter records, one per task, in array-index order.
    pub records: Vec<serde_json::Value>,

    /// Directory the adapter writes the work file into.
    pub work_dir: Utf8PathBuf,

    /// Directory worker stdout/stderr land in.
    pub log_dir: Utf8PathBuf,

    pub resources: Resources,

    /// Accounting group to charge, if any.
    pub account: Option<String>,
}

impl SubmitRequest {
    pub fn array_len(&self) -> u32 {
        self.records.len() as u32
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("submission failed: {0}")]
    Submit(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("cancel failed: {0}")]
    Cancel(String),
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Transient errors yield no information about task state; the poll
    /// loop re-queries on the next tick instead of inferring failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Query(_))
    }
}

/// Minimal contract over an external workload manager.
pub trait Scheduler {
    /// Schedule a batch of tasks; returns the array job id.
    fn submit_array(
        &self,
        request: &SubmitRequest,
    ) -> impl Future<Output = Result<ArrayJobId, SchedulerError>>;

    /// Observed state per task id for one array job.
    fn query(
        &self,
        id: &ArrayJobId,
    ) -> impl Future<Output = Result<BTreeMap<u32, TaskState>, SchedulerError>>;

    /// Best-effort termination of an array job, or of specific tasks
    /// within it.
    fn cancel(
        &self,
        id: &ArrayJobId,
        task_ids: Option<&[u32]>,
    ) -> impl Future<Output = Result<(), SchedulerError>>;

    /// Array jobs still known to the scheduler, for restart-time
    /// reconciliation.
    fn list_active(
        &self,
        account: Option<&str>,
        name_prefix: &str,
    ) -> impl Future<Output = Result<Vec<ArrayJobId>, SchedulerError>>;
}

impl<T: Scheduler> Scheduler for &T {
    async fn submit_array(&self, request: &SubmitRequest) -> Result<ArrayJobId, SchedulerError> {
        (**self).submit_array(request).await
    }

    async fn query(&self, id: &ArrayJobId) -> Result<BTreeMap<u32, TaskState>, SchedulerError> {
        (**self).query(id).await
    }

    async fn cancel(
        &self,
        id: &ArrayJobId,
        task_ids: Option<&[u32]>,
    ) -> Result<(), SchedulerError> {
        (**self).cancel(id, task_ids).await
    }

    async fn list_active(
        &self,
        account: Option<&str>,
        name_prefix: &str,
    ) -> Result<Vec<ArrayJobId>, SchedulerError> {
        (**self).list_active(account, name_prefix).await
    }
}
