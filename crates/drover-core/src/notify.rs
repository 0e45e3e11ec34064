//! One-way sink for human-visible pipeline events.

use crate::types::{JobCounts, RunSummary};
use std::future::Future;

/// Event sink driven by the supervisor.
///
/// Delivery is fire-and-forget: implementations log and drop their own
/// failures, which is why nothing here returns a `Result`.
pub trait Notifier {
    fn pipeline_started(&self, pipeline: &str, jobs: usize) -> impl Future<Output = ()>;

    fn job_started(&self, job: &str, packages: usize) -> impl Future<Output = ()>;

    fn job_completed(&self, job: &str, counts: &JobCounts) -> impl Future<Output = ()>;

    fn pipeline_completed(&self, summary: &RunSummary) -> impl Future<Output = ()>;

    fn error(&self, message: &str) -> impl Future<Output = ()>;
}

/// Notifier that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    async fn pipeline_started(&self, _pipeline: &str, _jobs: usize) {}

    async fn job_started(&self, _job: &str, _packages: usize) {}

    async fn job_completed(&self, _job: &str, _counts: &JobCounts) {}

    async fn pipeline_completed(&self, _summary: &RunSummary) {}

    async fn error(&self, _message: &str) {}
}
