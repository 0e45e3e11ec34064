//! CLI argument parsing for drover.

use camino::Utf8PathBuf;
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Drive declarative batch pipelines through Slurm")]
pub struct Args {
    /// Root directory for run state and logs
    #[arg(short = 'l', long, global = true, default_value = "logs")]
    pub log_dir: Utf8PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the supervisor for a pipeline config
    Start {
        /// Pipeline config file (YAML)
        config: Utf8PathBuf,

        /// Scheduler account to charge
        #[arg(short, long)]
        account: Option<String>,

        /// Conda environment name or path for the workers
        #[arg(short = 'e', long)]
        env: Option<String>,
    },

    /// Cancel outstanding submissions; without -j this is a full abort
    Abort {
        /// Cancel only this job's buckets, leaving the supervisor
        /// running
        #[arg(short, long)]
        job: Option<String>,

        /// Cancel every outstanding submission and stop the supervisor
        /// (the default when no job is named)
        #[arg(long, conflicts_with = "job")]
        all: bool,
    },

    /// Print per-job work-package counts
    Status,

    /// List a job's work packages with state and params
    Work {
        /// Job name (or full bucket name)
        job: String,
    },

    /// Print worker stdout files
    Stdout(LogArgs),

    /// Print worker stderr files
    Stderr(LogArgs),

    /// Restart the supervisor against the previous run, resubmitting
    /// only FAILED packages
    Retry {
        /// Scheduler account to charge
        #[arg(short, long)]
        account: Option<String>,

        /// Conda environment name or path for the workers
        #[arg(short = 'e', long)]
        env: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
pub struct LogArgs {
    /// JOB or JOB.INDEX selector
    #[arg(short, long)]
    pub job: Option<String>,

    /// Array job id
    #[arg(short = 'i', long)]
    pub job_id: Option<String>,

    /// Only print lines matching this regex
    #[arg(short = 'p', long)]
    pub pattern: Option<String>,
}
