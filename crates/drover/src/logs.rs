//! Readers over the worker log directory conventions.

use crate::supervisor::SupervisorError;
use camino::{Utf8Path, Utf8PathBuf};
use drover_store::{RunPaths, WorkStore};
use regex::Regex;
use std::fs;

/// Which worker stream to read.
#[derive(Debug, Clone, Copy)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Parse a `JOB` or `JOB.INDEX` selector.
fn parse_selector(selector: &str) -> (&str, Option<u32>) {
    if let Some((head, tail)) = selector.rsplit_once('.') {
        if let Ok(index) = tail.parse::<u32>() {
            return (head, Some(index));
        }
    }
    (selector, None)
}

/// Print worker log files selected by job, array job id, or both,
/// optionally filtering lines by regex.
pub fn print_logs(
    log_root: &Utf8Path,
    stream: LogStream,
    job: Option<&str>,
    job_id: Option<&str>,
    pattern: Option<&Regex>,
) -> Result<(), SupervisorError> {
    let run = RunPaths::open_latest(log_root)?;
    let store = WorkStore::new(&run)?;

    let selector = job.map(parse_selector);
    let mut paths: Vec<Utf8PathBuf> = Vec::new();
    for wp in store.snapshot()? {
        if let Some((name, index)) = selector {
            if wp.job_name != name && wp.base_job != name {
                continue;
            }
            if index.is_some_and(|i| i != wp.index) {
                continue;
            }
        }
        if let Some(id) = job_id {
            if wp
                .external
                .as_ref()
                .is_none_or(|e| e.array_job_id != id)
            {
                continue;
            }
        }
        if let Some(log_paths) = wp.log_paths {
            let path = match stream {
                LogStream::Stdout => log_paths.stdout,
                LogStream::Stderr => log_paths.stderr,
            };
            if path.exists() && !paths.contains(&path) {
                paths.push(path);
            }
        }
    }

    if paths.is_empty() {
        println!("no log files found");
        return Ok(());
    }

    for path in paths {
        println!("==> {path} <==");
        let content = fs::read_to_string(&path)?;
        for line in content.lines() {
            if pattern.is_none_or(|re| re.is_match(line)) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!(parse_selector("align"), ("align", None));
        assert_eq!(parse_selector("align.3"), ("align", Some(3)));
        assert_eq!(
            parse_selector("feature-engineering.small-cities"),
            ("feature-engineering.small-cities", None)
        );
        assert_eq!(
            parse_selector("feature-engineering.small-cities.7"),
            ("feature-engineering.small-cities", Some(7))
        );
    }
}
