//! Parameter expansion and resource-bucket partitioning.
//!
//! The expander turns a job's heterogeneous parameter sources into a
//! flat, deterministic sequence of records; the partitioner assigns each
//! resulting work package to a resource bucket via the job's
//! special-case predicates.

pub mod expand;
pub mod partition;

pub use expand::{ExpandError, expand_file, expand_job};
pub use partition::{Bucket, partition};
