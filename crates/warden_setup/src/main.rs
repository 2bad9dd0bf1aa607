//! warden-setup - provisioning entry point
//!
//! Runs the orchestrator on a blocking task while the main task waits for
//! SIGINT/SIGTERM. On a signal the in-flight step's process group is stopped
//! and then the run lock is released, so the next invocation is neither locked
//! out nor racing a leftover child.

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use owo_colors::OwoColorize;
use std::path::Path;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use warden_common::orchestrator::step_statuses;
use warden_common::{
    ActionExecutor, Config, DefaultStepSource, MarkerStore, Orchestrator, ProcessGroups,
    ProvisionError, RunLock, RunReport, SystemResolver, SystemRunner, Systemd,
};

/// Conventional exit status for termination by signal
const EXIT_INTERRUPTED: i32 = 130;

/// How long a step's commands get to exit after SIGTERM before SIGKILL
const STEP_STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not errors
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            1
        }
    };
    process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;

    if cli.list {
        list_steps(&config);
        return Ok(0);
    }
    if let Some(step) = &cli.reset {
        return reset_step(&config, step);
    }

    let paths = config.state_paths();
    let log_path = paths.provision_log();
    logging::init(Some(&log_path))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %Config::resolve_path(cli.config.as_deref()).display(),
        "warden-setup starting"
    );

    let lock = RunLock::new(paths.lock_file(), config.provision.lock_liveness_check);
    let resume = cli.resume_command();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let groups = ProcessGroups::new();
    let step_groups = groups.clone();
    let task = tokio::task::spawn_blocking(move || provision(config, step_groups));

    tokio::select! {
        joined = task => {
            let result = joined.context("Provisioning task failed")?;
            Ok(report_result(result, &resume, &log_path))
        }
        _ = tokio::signal::ctrl_c() => Ok(interrupted(&lock, &groups, "SIGINT", &resume, &log_path)),
        _ = sigterm.recv() => Ok(interrupted(&lock, &groups, "SIGTERM", &resume, &log_path)),
    }
}

fn provision(config: Config, groups: ProcessGroups) -> Result<RunReport> {
    let runner = SystemRunner::new(Duration::from_secs(
        config.provision.default_command_timeout_secs,
    ))
    .with_groups(groups.clone());
    let supervisor = Systemd::new(
        config.service.name.clone(),
        SystemRunner::new(Duration::from_secs(config.health.command_timeout_secs))
            .with_groups(groups),
    );
    let source = DefaultStepSource::new(Duration::from_secs(config.provision.fetch_timeout_secs))
        .context("Failed to build step source")?;
    let executor = ActionExecutor::new(&runner, &supervisor, &SystemResolver, &config);

    let mut orchestrator = Orchestrator::new(&config, source, executor);
    Ok(orchestrator.run()?)
}

fn report_result(result: Result<RunReport>, resume: &str, log_path: &Path) -> i32 {
    match result {
        Ok(report) => {
            println!(
                "{} provisioning complete: {} step(s) run, {} already done",
                "✓".green().bold(),
                report.executed.len(),
                report.skipped.len()
            );
            0
        }
        Err(e) => {
            eprintln!("{} {:#}", "provisioning halted:".red().bold(), e);
            let hint = match e.downcast_ref::<ProvisionError>() {
                Some(err) => err.remediation(resume, log_path),
                None => format!("Re-run: {}\nLog: {}", resume, log_path.display()),
            };
            eprintln!("{}", hint.yellow());
            1
        }
    }
}

fn interrupted(
    lock: &RunLock,
    groups: &ProcessGroups,
    signal: &str,
    resume: &str,
    log_path: &Path,
) -> i32 {
    warn!(signal, "interrupted, stopping the running step");
    let stopped = groups.terminate(STEP_STOP_GRACE);
    info!(stopped, "step commands stopped, releasing run lock");
    lock.release();
    eprintln!("{} interrupted by {}", "provisioning stopped:".red().bold(), signal);
    eprintln!(
        "{}",
        format!(
            "Re-run to resume from the interrupted step: {}\nLog: {}",
            resume,
            log_path.display()
        )
        .yellow()
    );
    EXIT_INTERRUPTED
}

fn list_steps(config: &Config) {
    let markers = MarkerStore::new(config.state_paths());
    let statuses = step_statuses(&config.steps(), &markers);
    if statuses.is_empty() {
        println!("No steps configured");
        return;
    }
    for status in statuses {
        let number = status.step.ordinal + 1;
        match status.completed_at {
            Some(at) => println!(
                "{} {:>2}. {:<28} done {}",
                "✓".green(),
                number,
                status.step.name,
                at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => println!(
                "{} {:>2}. {:<28} pending",
                "·".yellow(),
                number,
                status.step.name
            ),
        }
    }
}

fn reset_step(config: &Config, step: &str) -> Result<i32> {
    if !config.provision.steps.iter().any(|s| s.name == step) {
        eprintln!(
            "{} {} is not a configured step",
            "warning:".yellow().bold(),
            step
        );
    }
    let markers = MarkerStore::new(config.state_paths());
    if markers.clear(step)? {
        println!("Cleared marker for {}; the next run repeats it", step);
    } else {
        println!("Step {} has no completion marker", step);
    }
    Ok(0)
}
