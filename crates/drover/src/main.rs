//! Drover - drive declarative batch pipelines through Slurm.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use drover::supervisor::{Supervisor, reset_failed};
use drover::{commands, logs};
use drover_cli::{Args, Command, LogArgs};
use drover_config::PipelineSpec;
use drover_notify::PipelineNotifier;
use drover_slurm::SlurmScheduler;
use drover_store::{RunPaths, WorkStore};
use miette::{IntoDiagnostic, Result};
use regex::Regex;
use std::fs;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Start {
            config,
            account,
            env,
        } => start(&args.log_dir, &config, account, env).await,
        Command::Retry { account, env } => retry(&args.log_dir, account, env).await,
        Command::Abort { job, all } => {
            init_tracing("warn");
            commands::abort(&args.log_dir, job.as_deref(), all)
                .await
                .into_diagnostic()
        }
        Command::Status => {
            init_tracing("warn");
            commands::status(&args.log_dir).into_diagnostic()
        }
        Command::Work { job } => {
            init_tracing("warn");
            commands::work(&args.log_dir, &job).into_diagnostic()
        }
        Command::Stdout(log_args) => print_logs(&args.log_dir, logs::LogStream::Stdout, log_args),
        Command::Stderr(log_args) => print_logs(&args.log_dir, logs::LogStream::Stderr, log_args),
    }
}

async fn start(
    log_root: &Utf8Path,
    config: &Utf8Path,
    account: Option<String>,
    env: Option<String>,
) -> Result<()> {
    let mut spec = PipelineSpec::load(config).into_diagnostic()?;
    apply_overrides(&mut spec, account, env);
    init_tracing(&spec.properties.log_level);
    spec.validate().into_diagnostic()?;

    let run = RunPaths::create(log_root).into_diagnostic()?;
    // Keep a copy so `retry` and the readers work without the original.
    fs::copy(config, run.root().join("pipeline.yml")).into_diagnostic()?;

    run_supervisor(spec, run).await
}

async fn retry(log_root: &Utf8Path, account: Option<String>, env: Option<String>) -> Result<()> {
    let run = RunPaths::open_latest(log_root).into_diagnostic()?;
    let config = run.root().join("pipeline.yml");
    let mut spec = PipelineSpec::load(&config).into_diagnostic()?;
    apply_overrides(&mut spec, account, env);
    init_tracing(&spec.properties.log_level);
    spec.validate().into_diagnostic()?;

    let store = WorkStore::new(&run).into_diagnostic()?;
    let reopened = reset_failed(&store).into_diagnostic()?;
    tracing::info!(reopened, "reopened failed packages for retry");

    run_supervisor(spec, run).await
}

async fn run_supervisor(spec: PipelineSpec, run: RunPaths) -> Result<()> {
    let sched = SlurmScheduler::new(&run.root()).into_diagnostic()?;
    let notifier = PipelineNotifier::from_slack(
        spec.properties
            .slack
            .as_ref()
            .map(|s| (s.channel.as_str(), s.token.as_str())),
    );

    let (abort_tx, abort_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).into_diagnostic()?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("abort signal received");
        let _ = abort_tx.send(true);
    });

    let mut supervisor =
        Supervisor::new(spec, run, sched, notifier, abort_rx).into_diagnostic()?;
    let outcome = supervisor.run().await.into_diagnostic()?;

    let s = &outcome.summary;
    println!(
        "pipeline {}: {}/{} packages succeeded, {} failed, {} cancelled",
        if s.aborted { "aborted" } else { "finished" },
        s.succeeded,
        s.packages,
        s.failed,
        s.cancelled
    );
    if outcome.aborted {
        std::process::exit(130);
    }
    Ok(())
}

fn print_logs(log_root: &Utf8PathBuf, stream: logs::LogStream, args: LogArgs) -> Result<()> {
    init_tracing("warn");
    let pattern = args
        .pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .into_diagnostic()?;
    logs::print_logs(
        log_root,
        stream,
        args.job.as_deref(),
        args.job_id.as_deref(),
        pattern.as_ref(),
    )
    .into_diagnostic()
}

fn apply_overrides(spec: &mut PipelineSpec, account: Option<String>, env: Option<String>) {
    if account.is_some() {
        spec.properties.account = account;
    }
    if env.is_some() {
        spec.properties.conda_env = env;
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
