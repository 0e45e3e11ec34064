//! Drover - control-plane supervisor for Slurm batch pipelines.

pub mod commands;
pub mod logs;
pub mod supervisor;

pub use supervisor::{RunOutcome, Supervisor, SupervisorError, reset_failed};
