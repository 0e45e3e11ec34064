//! Memory-request parsing.

/// Parse a Slurm memory string to megabytes.
///
/// Handles "4G", "1000M", "4096K", bare "4096" (assumed MB), and the
/// sacct per-node/per-core suffixes "4Gn"/"1000Mc".
///
/// Returns None for empty strings or placeholder values.
pub fn parse_memory_mb(s: &str) -> Option<u64> {
    if s.is_empty() || s == "-" {
        return None;
    }

    let s = s.trim().trim_end_matches(['n', 'c']);

    if let Some(stripped) = s.strip_suffix('G') {
        stripped.parse::<u64>().ok().map(|v| v * 1024)
    } else if let Some(stripped) = s.strip_suffix('M') {
        stripped.parse::<u64>().ok()
    } else if let Some(stripped) = s.strip_suffix('K') {
        stripped.parse::<u64>().ok().map(|v| v / 1024)
    } else {
        // Assume MB if no suffix
        s.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_mb() {
        assert_eq!(parse_memory_mb("4G"), Some(4096));
        assert_eq!(parse_memory_mb("1000M"), Some(1000));
        assert_eq!(parse_memory_mb("4096K"), Some(4));
        assert_eq!(parse_memory_mb("4096"), Some(4096));
        assert_eq!(parse_memory_mb(""), None);
    }

    #[test]
    fn test_parse_sacct_suffixes() {
        assert_eq!(parse_memory_mb("4Gn"), Some(4096));
        assert_eq!(parse_memory_mb("1000Mc"), Some(1000));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_memory_mb("lots"), None);
        assert_eq!(parse_memory_mb("-"), None);
    }
}
