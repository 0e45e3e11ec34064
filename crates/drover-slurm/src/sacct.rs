//! Parsing of `sacct` and `squeue` output for array jobs.

use drover_core::TaskState;
use drover_parsers::{parse_exit_code, split_delimited};
use std::collections::BTreeMap;
use thiserror::Error;

/// sacct output format (--parsable2 uses | delimiter).
/// JobID carries the `<array_job_id>_<task_id>` form for array tasks.
pub const SACCT_FORMAT: &str = "JobID,State,ExitCode";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to parse sacct output: {0}")]
    Sacct(String),
}

/// Parse Slurm state plus exit-code pair into a task state.
///
/// sacct states can have suffixes like "CANCELLED by 12345". Anything
/// terminal and unsuccessful (cancelled outside drover included) is a
/// failure subject to the normal retry policy.
pub fn parse_task_state(state_str: &str, exit_code_str: &str) -> Option<TaskState> {
    let base_state = state_str.split_whitespace().next().unwrap_or(state_str);
    let exit_code = parse_exit_code(exit_code_str);

    match base_state.to_uppercase().as_str() {
        "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => Some(TaskState::Pending),
        "RUNNING" | "COMPLETING" => Some(TaskState::Running),
        "COMPLETED" => Some(TaskState::Succeeded),
        "FAILED" | "OUT_OF_MEMORY" | "TIMEOUT" | "DEADLINE" | "PREEMPTED" => {
            Some(TaskState::Failed {
                exit_code: if exit_code != 0 { exit_code } else { 1 },
            })
        }
        "CANCELLED" | "NODE_FAIL" | "BOOT_FAIL" => Some(TaskState::Failed { exit_code: -1 }),
        _ => None,
    }
}

/// Expand the task-id part of an array JobID.
///
/// Running/finished tasks report as `12345_7`; pending tasks aggregate
/// as `12345_[0-3,5%2]` (the `%limit` suffix is noise).
pub fn parse_task_ids(task_part: &str) -> Vec<u32> {
    if let Some(inner) = task_part.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let inner = inner.split('%').next().unwrap_or(inner);
        let mut ids = Vec::new();
        for piece in inner.split(',') {
            if let Some((lo, hi)) = piece.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    ids.extend(lo..=hi);
                }
            } else if let Ok(id) = piece.parse::<u32>() {
                ids.push(id);
            }
        }
        ids
    } else {
        task_part.parse::<u32>().map(|id| vec![id]).unwrap_or_default()
    }
}

/// Parse `sacct --parsable2 --noheader` output for one array job into a
/// per-task state map. Job-step rows (`12345_7.batch`) are skipped;
/// unparseable lines are warned about and dropped, matching the
/// "no information" stance on transient scheduler noise.
pub fn parse_sacct_tasks(
    array_job_id: &str,
    output: &str,
) -> Result<BTreeMap<u32, TaskState>, ParseError> {
    let mut tasks = BTreeMap::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_delimited(line, 3).map_err(ParseError::Sacct)?;
        let job_id = fields[0];

        // Skip job steps like "12345_7.batch".
        if job_id.contains('.') {
            continue;
        }
        let Some((base, task_part)) = job_id.split_once('_') else {
            continue;
        };
        if base != array_job_id {
            continue;
        }
        let Some(state) = parse_task_state(fields[1], fields[2]) else {
            tracing::warn!(line, "unrecognized sacct state");
            continue;
        };

        for task_id in parse_task_ids(task_part) {
            tasks.insert(task_id, state);
        }
    }

    Ok(tasks)
}

/// Parse `squeue -h -o '%i|%j'` output into `(array_job_id, job_name)`
/// pairs, collapsing per-task and aggregate rows to the base array id.
pub fn parse_squeue_active(output: &str) -> Vec<(String, String)> {
    let mut seen = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(fields) = split_delimited(line, 2) else {
            continue;
        };
        let base = fields[0].split('_').next().unwrap_or(fields[0]).to_string();
        let name = fields[1].to_string();
        if !seen.iter().any(|(id, _)| *id == base) {
            seen.push((base, name));
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_state() {
        assert_eq!(parse_task_state("RUNNING", "0:0"), Some(TaskState::Running));
        assert_eq!(parse_task_state("PENDING", "0:0"), Some(TaskState::Pending));
        assert_eq!(
            parse_task_state("COMPLETED", "0:0"),
            Some(TaskState::Succeeded)
        );
        assert_eq!(
            parse_task_state("FAILED", "137:9"),
            Some(TaskState::Failed { exit_code: 137 })
        );
        assert_eq!(
            parse_task_state("CANCELLED by 1000", "0:0"),
            Some(TaskState::Failed { exit_code: -1 })
        );
        assert_eq!(parse_task_state("WEDGED", "0:0"), None);
    }

    #[test]
    fn test_parse_task_ids_single_and_ranges() {
        assert_eq!(parse_task_ids("7"), vec![7]);
        assert_eq!(parse_task_ids("[0-3]"), vec![0, 1, 2, 3]);
        assert_eq!(parse_task_ids("[0-1,4]"), vec![0, 1, 4]);
        assert_eq!(parse_task_ids("[0-2%1]"), vec![0, 1, 2]);
        assert!(parse_task_ids("batch").is_empty());
    }

    #[test]
    fn test_parse_sacct_tasks_mixed_rows() {
        let output = "\
12345_0|COMPLETED|0:0
12345_0.batch|COMPLETED|0:0
12345_1|FAILED|1:0
12345_[2-3]|PENDING|0:0
99999_0|COMPLETED|0:0
";
        let tasks = parse_sacct_tasks("12345", output).unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[&0], TaskState::Succeeded);
        assert_eq!(tasks[&1], TaskState::Failed { exit_code: 1 });
        assert_eq!(tasks[&2], TaskState::Pending);
        assert_eq!(tasks[&3], TaskState::Pending);
    }

    #[test]
    fn test_parse_squeue_active_collapses_tasks() {
        let output = "\
12345_0|run-a.align
12345_1|run-a.align
12400_[0-9]|run-a.features
";
        let active = parse_squeue_active(output);
        assert_eq!(
            active,
            vec![
                ("12345".to_string(), "run-a.align".to_string()),
                ("12400".to_string(), "run-a.features".to_string()),
            ]
        );
    }
}
