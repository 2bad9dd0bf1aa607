//! wardenctl - operational CLI for the managed service
//!
//! Exit codes: 0 healthy/success, 2 unhealthy (no or failed remediation),
//! 1 usage or configuration error.

pub mod cli;

use anyhow::{Context, Result};
use cli::Action;
use owo_colors::OwoColorize;
use std::io::Write;
use tracing::debug;
use warden_common::health::HealthSample;
use warden_common::orchestrator::step_statuses;
use warden_common::{
    AuditLog, Config, HealthProbe, HttpProbe, MarkerStore, Outcome, ProcessTable,
    RemediationController, RemediationDecision, RemediationTiming, ServiceSupervisor,
};

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_UNHEALTHY: i32 = 2;

/// Audit entries shown by `--status`
const STATUS_AUDIT_ENTRIES: usize = 5;

/// External collaborators the commands talk to
pub struct Services<'a> {
    pub supervisor: &'a dyn ServiceSupervisor,
    pub processes: &'a dyn ProcessTable,
    pub http: &'a dyn HttpProbe,
}

/// Run one action and return the process exit code
pub fn execute(
    action: Action,
    config: &Config,
    services: &Services<'_>,
    timing: RemediationTiming,
    out: &mut dyn Write,
) -> Result<i32> {
    debug!(?action, unit = services.supervisor.unit(), "wardenctl action");
    let probe = HealthProbe::new(
        services.supervisor,
        services.processes,
        services.http,
        config.service.process_pattern(),
        config.health.threshold,
        AuditLog::new(config.state_paths().audit_log()),
    );

    match action {
        Action::Status => status(config, services.supervisor, &probe, out),
        Action::Logs(lines) => {
            let logs = services
                .supervisor
                .logs(lines)
                .with_context(|| format!("Failed to read logs of {}", config.service.name))?;
            write!(out, "{}", logs)?;
            Ok(EXIT_OK)
        }
        Action::Health { auto_remediate } => {
            let controller = RemediationController::new(&probe, timing);
            let sample = probe.sample();
            print_sample(&sample, out)?;
            let decision = controller.evaluate(&sample, auto_remediate);
            if decision == RemediationDecision::RestartAndReverify {
                writeln!(out, "{} unhealthy, restarting {}", "→".yellow(), config.service.name)?;
            }
            let outcome = controller.apply(decision, &sample);
            print_outcome(&outcome, out)?;
            Ok(outcome.exit_code())
        }
        Action::Restart => {
            let controller = RemediationController::new(&probe, timing);
            let sample = probe.sample();
            writeln!(out, "Restarting {}", config.service.name)?;
            let outcome = controller.apply(RemediationDecision::RestartAndReverify, &sample);
            print_outcome(&outcome, out)?;
            Ok(outcome.exit_code())
        }
    }
}

fn status(
    config: &Config,
    supervisor: &dyn ServiceSupervisor,
    probe: &HealthProbe<'_>,
    out: &mut dyn Write,
) -> Result<i32> {
    writeln!(out, "{}", format!("Service {}", config.service.name).bold())?;
    match supervisor.is_active() {
        Ok(true) => writeln!(out, "  supervisor: {}", "active".green())?,
        Ok(false) => writeln!(out, "  supervisor: {}", "inactive".red())?,
        Err(e) => writeln!(out, "  supervisor: {} ({})", "unknown".yellow(), e)?,
    }
    match supervisor.main_pid() {
        Ok(Some(pid)) => writeln!(out, "  main pid:   {}", pid)?,
        Ok(None) => writeln!(out, "  main pid:   -")?,
        Err(e) => writeln!(out, "  main pid:   unknown ({})", e)?,
    }
    if let Ok(text) = supervisor.status_text() {
        for line in text.lines().take(3) {
            writeln!(out, "  | {}", line)?;
        }
    }

    let steps = step_statuses(&config.steps(), &MarkerStore::new(config.state_paths()));
    let done = steps.iter().filter(|s| s.completed_at.is_some()).count();
    writeln!(out)?;
    writeln!(out, "{}", "Provisioning".bold())?;
    writeln!(out, "  steps complete: {}/{}", done, steps.len())?;
    if let Some(next) = steps.iter().find(|s| s.completed_at.is_none()) {
        writeln!(out, "  next step:      {}", next.step.name)?;
    }

    writeln!(out)?;
    writeln!(out, "{}", "Recent health checks".bold())?;
    let recent = probe.audit().read_recent(STATUS_AUDIT_ENTRIES);
    if recent.is_empty() {
        writeln!(out, "  (none recorded)")?;
    }
    for entry in recent {
        writeln!(
            out,
            "  {}  {}",
            entry.timestamp().format("%Y-%m-%d %H:%M:%S"),
            entry.describe()
        )?;
    }
    Ok(EXIT_OK)
}

fn mark(ok: bool) -> String {
    if ok {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    }
}

fn print_sample(sample: &HealthSample, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "  supervisor active: {}", mark(sample.signals.supervisor_active))?;
    writeln!(out, "  process present:   {}", mark(sample.signals.process_present))?;
    writeln!(out, "  probe ok:          {}", mark(sample.signals.probe_ok))?;
    writeln!(
        out,
        "  score:             {}/3 (healthy at {})",
        sample.score, sample.threshold
    )?;
    Ok(())
}

fn print_outcome(outcome: &Outcome, out: &mut dyn Write) -> Result<()> {
    let text = outcome.to_string();
    if outcome.is_success() {
        writeln!(out, "{} {}", "✓".green().bold(), text.green())?;
    } else {
        writeln!(out, "{} {}", "✗".red().bold(), text.red())?;
    }
    Ok(())
}
