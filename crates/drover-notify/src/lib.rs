//! Notifier implementations.
//!
//! All of these are one-way sinks: delivery failures are logged at WARN
//! and dropped, never surfaced to the supervisor.

use drover_core::{JobCounts, Notifier, RunSummary};

const SLACK_POST_MESSAGE: &str = "https://slack.com/api/chat.postMessage";

/// Posts pipeline events to a Slack channel via `chat.postMessage`.
pub struct SlackNotifier {
    client: reqwest::Client,
    channel: String,
    token: String,
}

impl SlackNotifier {
    pub fn new(channel: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            channel: channel.into(),
            token: token.into(),
        }
    }

    async fn post(&self, text: String) {
        let body = serde_json::json!({
            "channel": self.channel,
            "text": text,
        });
        let response = self
            .client
            .post(SLACK_POST_MESSAGE)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(payload) if payload["ok"] == serde_json::json!(false) => {
                        tracing::warn!(error = %payload["error"], "slack rejected notification");
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "unreadable slack response"),
                }
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "slack notification failed");
            }
            Err(error) => tracing::warn!(%error, "slack notification failed"),
        }
    }
}

impl Notifier for SlackNotifier {
    async fn pipeline_started(&self, pipeline: &str, jobs: usize) {
        self.post(format!(":rocket: pipeline `{pipeline}` started ({jobs} jobs)"))
            .await;
    }

    async fn job_started(&self, job: &str, packages: usize) {
        self.post(format!("job `{job}` started ({packages} work packages)"))
            .await;
    }

    async fn job_completed(&self, job: &str, counts: &JobCounts) {
        let icon = if counts.failed > 0 { ":warning:" } else { ":white_check_mark:" };
        self.post(format!("{icon} job `{job}` completed ({counts})"))
            .await;
    }

    async fn pipeline_completed(&self, summary: &RunSummary) {
        let outcome = if summary.aborted {
            "aborted"
        } else if summary.failed > 0 {
            "completed with failures"
        } else {
            "completed"
        };
        self.post(format!(
            "pipeline {outcome}: {}/{} packages succeeded, {} failed, {} cancelled",
            summary.succeeded, summary.packages, summary.failed, summary.cancelled
        ))
        .await;
    }

    async fn error(&self, message: &str) {
        self.post(format!(":x: {message}")).await;
    }
}

/// Fallback notifier that narrates events into the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn pipeline_started(&self, pipeline: &str, jobs: usize) {
        tracing::info!(pipeline, jobs, "pipeline started");
    }

    async fn job_started(&self, job: &str, packages: usize) {
        tracing::info!(job, packages, "job started");
    }

    async fn job_completed(&self, job: &str, counts: &JobCounts) {
        tracing::info!(job, %counts, "job completed");
    }

    async fn pipeline_completed(&self, summary: &RunSummary) {
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            aborted = summary.aborted,
            "pipeline completed"
        );
    }

    async fn error(&self, message: &str) {
        tracing::error!(message, "pipeline error");
    }
}

/// Process-level notifier choice, resolved from the config.
pub enum PipelineNotifier {
    Slack(SlackNotifier),
    Log(LogNotifier),
}

impl PipelineNotifier {
    pub fn from_slack(slack: Option<(&str, &str)>) -> Self {
        match slack {
            Some((channel, token)) => Self::Slack(SlackNotifier::new(channel, token)),
            None => Self::Log(LogNotifier),
        }
    }
}

impl Notifier for PipelineNotifier {
    async fn pipeline_started(&self, pipeline: &str, jobs: usize) {
        match self {
            Self::Slack(n) => n.pipeline_started(pipeline, jobs).await,
            Self::Log(n) => n.pipeline_started(pipeline, jobs).await,
        }
    }

    async fn job_started(&self, job: &str, packages: usize) {
        match self {
            Self::Slack(n) => n.job_started(job, packages).await,
            Self::Log(n) => n.job_started(job, packages).await,
        }
    }

    async fn job_completed(&self, job: &str, counts: &JobCounts) {
        match self {
            Self::Slack(n) => n.job_completed(job, counts).await,
            Self::Log(n) => n.job_completed(job, counts).await,
        }
    }

    async fn pipeline_completed(&self, summary: &RunSummary) {
        match self {
            Self::Slack(n) => n.pipeline_completed(summary).await,
            Self::Log(n) => n.pipeline_completed(summary).await,
        }
    }

    async fn error(&self, message: &str) {
        match self {
            Self::Slack(n) => n.error(message).await,
            Self::Log(n) => n.error(message).await,
        }
    }
}
