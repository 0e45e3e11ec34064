//! Slurm implementation of the drover scheduler contract.
//!
//! Buckets are submitted as `sbatch --array` jobs whose tasks invoke the
//! embedded launcher script; task state comes back through `sacct`,
//! cancellation goes through `scancel`, and restart reconciliation lists
//! live arrays with `squeue`.

pub mod adapter;
pub mod sacct;

pub use adapter::SlurmScheduler;
