//! Deadline-bounded execution of scheduler commands.

use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {command}: {error}")]
    Spawn { command: String, error: String },
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

/// Run a scheduler command under a deadline and return its stdout.
///
/// Every interaction with the workload manager goes through here: the
/// control loop must never wedge on a slow scheduler, so a command
/// that outlives its deadline is killed and reported as `Timeout`,
/// which callers treat as "no information" rather than failure.
pub async fn run_command_deadline(
    cmd: &mut Command,
    name: &str,
    deadline: Duration,
) -> Result<String, CommandError> {
    cmd.kill_on_drop(true);

    let Ok(result) = tokio::time::timeout(deadline, cmd.output()).await else {
        return Err(CommandError::Timeout {
            command: name.to_string(),
            seconds: deadline.as_secs(),
        });
    };
    let output = result.map_err(|e| CommandError::Spawn {
        command: name.to_string(),
        error: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: name.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_stdout_captured() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let stdout = run_command_deadline(&mut cmd, "echo", DEADLINE).await.unwrap();
        assert_eq!(stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let mut cmd = Command::new("nonexistent_command_12345");
        let result = run_command_deadline(&mut cmd, "nonexistent", DEADLINE).await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_status_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let result = run_command_deadline(&mut cmd, "sh", DEADLINE).await;
        match result {
            Err(CommandError::Failed { status, stderr, .. }) => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_kills_slow_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_command_deadline(&mut cmd, "sleep", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }
}
