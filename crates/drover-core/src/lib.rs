//! Work-package model and scheduler contract for drover.
//!
//! This crate defines the atomic unit of work (the [`WorkPackage`] and its
//! lifecycle), the [`Scheduler`] contract the supervisor drives, and the
//! [`Notifier`] sink for human-visible events. The production Slurm
//! implementation lives in `drover-slurm`; [`MemoryScheduler`] is the
//! in-process implementation used by tests and dry runs.

pub mod memory;
pub mod notify;
pub mod scheduler;
pub mod types;

pub use memory::MemoryScheduler;
pub use notify::{Notifier, NullNotifier};
pub use scheduler::{ArrayJobId, Scheduler, SchedulerError, SubmitRequest, TaskState};
pub use types::{
    ExternalId, JobCounts, LogPaths, Resources, RunSummary, TransitionError, WorkError,
    WorkPackage, WorkState,
};
