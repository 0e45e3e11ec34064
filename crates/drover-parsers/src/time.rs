//! Time-limit parsing and rendering.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static HMS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\d+-)?\d{1,2}:\d{2}:\d{2}$").unwrap());

/// Whether `s` is a valid `HH:MM:SS` time limit (with an optional
/// Slurm-style `D-` day prefix).
pub fn is_hms(s: &str) -> bool {
    HMS_RE.is_match(s)
}

/// Parse a duration in various scheduler formats.
///
/// Supports:
/// - D-HH:MM:SS (time limit with days)
/// - HH:MM:SS
/// - MM:SS
/// - Seconds as integer
///
/// Returns None for "UNLIMITED" or empty strings.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() || s == "UNLIMITED" || s == "-" {
        return None;
    }

    // Check for day separator (D-HH:MM:SS)
    let parts: Vec<&str> = s.split('-').collect();
    let (days, time_part) = if parts.len() == 2 {
        (parts[0].parse::<u64>().unwrap_or(0), parts[1])
    } else {
        (0, parts[0])
    };

    let time_parts: Vec<u64> = time_part
        .split(':')
        .filter_map(|p| p.parse().ok())
        .collect();

    let seconds = match time_parts.len() {
        3 => time_parts[0] * 3600 + time_parts[1] * 60 + time_parts[2],
        2 => time_parts[0] * 60 + time_parts[1],
        1 => time_parts[0],
        _ => return None,
    };

    Some(Duration::from_secs(days * 86400 + seconds))
}

/// Render a duration in the `HH:MM:SS` form `sbatch --time` accepts.
/// Hours widen past two digits rather than rolling into days.
pub fn format_duration_hms(d: Duration) -> String {
    let total = d.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Parse exit code from the Slurm `exit_code:signal` pair.
///
/// Returns the exit code portion, defaulting to 0 if parsing fails.
pub fn parse_exit_code(s: &str) -> i32 {
    s.split(':')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
