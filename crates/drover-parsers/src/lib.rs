//! Shared parsing utilities for scheduler input and output.
//!
//! Used on both sides of the scheduler boundary: rendering resource
//! requests for `sbatch` and parsing `sacct`/`squeue` output back.

pub mod command;
pub mod memory;
pub mod time;

pub use command::{CommandError, run_command_deadline};
pub use memory::parse_memory_mb;
pub use time::{format_duration_hms, is_hms, parse_duration, parse_exit_code};

/// Filter helper for optional string fields.
/// Returns None if the string is empty or a placeholder value.
pub fn non_empty_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed == "N/A" || trimmed == "Unknown" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a pipe-delimited line and validate field count.
pub fn split_delimited(line: &str, min_fields: usize) -> Result<Vec<&str>, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < min_fields {
        return Err(format!(
            "Expected {} fields, got {}: {}",
            min_fields,
            fields.len(),
            line
        ));
    }
    Ok(fields)
}
