//! In-process scheduler used by supervisor tests and dry runs.
//!
//! Task outcomes are scripted per bucket: each successive submission whose
//! scheduler name ends in `.<key>` consumes the next outcome vector. An
//! outcome of [`TaskState::Running`] pins that task as running until the
//! array is cancelled.

use crate::scheduler::{ArrayJobId, Scheduler, SchedulerError, SubmitRequest, TaskState};
use crate::types::Resources;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::sync::Mutex;
use tokio::time::Instant;

/// Record of one `submit_array` call, kept for assertions.
#[derive(Debug, Clone)]
pub struct SubmittedArray {
    pub id: ArrayJobId,
    pub name: String,
    pub array_len: u32,
    pub resources: Resources,
    pub submitted_at: Instant,
}

#[derive(Debug)]
struct MemArray {
    name: String,
    finals: Vec<TaskState>,
    polls: u32,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct MemState {
    next_id: u64,
    scripts: HashMap<String, VecDeque<Vec<TaskState>>>,
    reject_submits: HashMap<String, u32>,
    arrays: BTreeMap<ArrayJobId, MemArray>,
    submissions: Vec<SubmittedArray>,
    cancels: Vec<ArrayJobId>,
}

/// Whether a scheduler job name (`<run_id>.<bucket>`) refers to `key`.
fn bucket_matches(job_name: &str, key: &str) -> bool {
    job_name.ends_with(&format!(".{key}"))
}

#[derive(Debug, Default)]
pub struct MemoryScheduler {
    state: Mutex<MemState>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script final task states for successive submissions of the bucket
    /// named `key` (scheduler job names end in `.<key>`). Missing entries
    /// default to [`TaskState::Succeeded`].
    pub fn script_outcomes(&self, key: &str, outcomes: Vec<Vec<TaskState>>) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Reject the next `count` submissions matching `key`.
    pub fn reject_submissions(&self, key: &str, count: u32) {
        let mut state = self.state.lock().unwrap();
        state.reject_submits.insert(key.to_string(), count);
    }

    /// Prime an array as if it had been submitted before a restart; the
    /// first query reports `finals` directly.
    pub fn insert_active_array(&self, id: &str, name: &str, finals: Vec<TaskState>) {
        let mut state = self.state.lock().unwrap();
        state.arrays.insert(
            ArrayJobId(id.to_string()),
            MemArray {
                name: name.to_string(),
                finals,
                polls: 1,
                cancelled: false,
            },
        );
    }

    pub fn submissions(&self) -> Vec<SubmittedArray> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn cancelled(&self) -> Vec<ArrayJobId> {
        self.state.lock().unwrap().cancels.clone()
    }
}

impl Scheduler for MemoryScheduler {
    async fn submit_array(&self, request: &SubmitRequest) -> Result<ArrayJobId, SchedulerError> {
        let mut state = self.state.lock().unwrap();

        let reject = state
            .reject_submits
            .iter()
            .find(|(key, count)| bucket_matches(&request.name, key) && **count > 0)
            .map(|(key, _)| key.clone());
        if let Some(key) = reject {
            *state.reject_submits.get_mut(&key).unwrap() -= 1;
            return Err(SchedulerError::Submit(format!(
                "scripted rejection for {}",
                request.name
            )));
        }

        state.next_id += 1;
        let id = ArrayJobId(format!("{}", 1000 + state.next_id));

        // Honor the work-file side of the contract.
        fs::create_dir_all(&request.work_dir)?;
        let work_file = request.work_dir.join(format!("{}_{}.json", request.name, id));
        fs::write(&work_file, serde_json::to_vec_pretty(&request.records)?)?;

        let finals = state
            .scripts
            .iter_mut()
            .find(|(key, _)| bucket_matches(&request.name, key))
            .and_then(|(_, queue)| queue.pop_front());
        let mut finals = finals.unwrap_or_default();
        finals.resize(request.records.len(), TaskState::Succeeded);

        state.arrays.insert(
            id.clone(),
            MemArray {
                name: request.name.clone(),
                finals,
                polls: 0,
                cancelled: false,
            },
        );
        state.submissions.push(SubmittedArray {
            id: id.clone(),
            name: request.name.clone(),
            array_len: request.array_len(),
            resources: request.resources.clone(),
            submitted_at: Instant::now(),
        });

        Ok(id)
    }

    async fn query(&self, id: &ArrayJobId) -> Result<BTreeMap<u32, TaskState>, SchedulerError> {
        let mut state = self.state.lock().unwrap();
        let array = state
            .arrays
            .get_mut(id)
            .ok_or_else(|| SchedulerError::Query(format!("unknown array job {id}")))?;

        array.polls += 1;
        let first_poll = array.polls == 1;
        Ok(array
            .finals
            .iter()
            .enumerate()
            .map(|(task_id, outcome)| {
                let observed = if first_poll { TaskState::Running } else { *outcome };
                (task_id as u32, observed)
            })
            .collect())
    }

    async fn cancel(
        &self,
        id: &ArrayJobId,
        _task_ids: Option<&[u32]>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(array) = state.arrays.get_mut(id) {
            array.cancelled = true;
        }
        state.cancels.push(id.clone());
        Ok(())
    }

    async fn list_active(
        &self,
        _account: Option<&str>,
        name_prefix: &str,
    ) -> Result<Vec<ArrayJobId>, SchedulerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .arrays
            .iter()
            .filter(|(_, array)| {
                !array.cancelled
                    && array.name.starts_with(name_prefix)
                    && (array.polls < 2 || array.finals.iter().any(|t| !t.is_terminal()))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}
