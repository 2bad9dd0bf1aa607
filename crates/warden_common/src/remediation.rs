//! Remediation controller
//!
//! Turns a health sample into a decision and carries it out. Remediation is
//! a single restart followed by re-sampling inside a bounded window. There is
//! never a second restart: a service that does not come back is reported as
//! still unhealthy so flapping stays visible.

use crate::config::HealthConfig;
use crate::health::audit::AuditEntry;
use crate::health::probe::HealthProbe;
use crate::health::HealthSample;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationDecision {
    NoOp,
    RestartAndReverify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Healthy, nothing done
    Healthy,
    /// Unhealthy and remediation was not requested
    Unhealthy,
    /// Restarted and the re-sample came back healthy
    Recovered,
    /// Restarted but still unhealthy when the window closed
    StillUnhealthy,
    /// The supervisor refused the restart
    RestartFailed(String),
}

impl Outcome {
    /// Process exit code for scripting callers
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Healthy | Outcome::Recovered => 0,
            Outcome::Unhealthy | Outcome::StillUnhealthy | Outcome::RestartFailed(_) => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Healthy => "healthy",
            Outcome::Unhealthy => "unhealthy",
            Outcome::Recovered => "recovered",
            Outcome::StillUnhealthy => "still_unhealthy",
            Outcome::RestartFailed(_) => "restart_failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::RestartFailed(reason) => write!(f, "restart failed: {}", reason),
            other => f.write_str(&other.label().replace('_', " ")),
        }
    }
}

/// Waits around the restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationTiming {
    pub restart_wait: Duration,
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
}

impl RemediationTiming {
    pub fn from_config(health: &HealthConfig) -> Self {
        Self {
            restart_wait: Duration::from_secs(health.restart_wait_secs),
            verify_timeout: Duration::from_secs(health.verify_timeout_secs),
            verify_poll: Duration::from_secs(health.verify_poll_secs.max(1)),
        }
    }

    pub fn immediate() -> Self {
        Self {
            restart_wait: Duration::ZERO,
            verify_timeout: Duration::ZERO,
            verify_poll: Duration::ZERO,
        }
    }
}

pub struct RemediationController<'a> {
    probe: &'a HealthProbe<'a>,
    timing: RemediationTiming,
}

impl<'a> RemediationController<'a> {
    pub fn new(probe: &'a HealthProbe<'a>, timing: RemediationTiming) -> Self {
        Self { probe, timing }
    }

    pub fn evaluate(&self, sample: &HealthSample, auto_remediate: bool) -> RemediationDecision {
        decide(sample, auto_remediate)
    }

    pub fn apply(&self, decision: RemediationDecision, sample: &HealthSample) -> Outcome {
        match decision {
            RemediationDecision::NoOp if sample.is_healthy() => Outcome::Healthy,
            RemediationDecision::NoOp => {
                warn!(score = sample.score, "service unhealthy, no remediation requested");
                Outcome::Unhealthy
            }
            RemediationDecision::RestartAndReverify => self.restart_and_reverify(),
        }
    }

    /// Sample, decide, apply
    pub fn check(&self, auto_remediate: bool) -> (HealthSample, Outcome) {
        let sample = self.probe.sample();
        let decision = self.evaluate(&sample, auto_remediate);
        let outcome = self.apply(decision, &sample);
        (sample, outcome)
    }

    fn restart_and_reverify(&self) -> Outcome {
        let supervisor = self.probe.supervisor();
        info!(unit = supervisor.unit(), "restarting service");

        if let Err(e) = supervisor.restart() {
            error!(unit = supervisor.unit(), error = %e, "restart failed");
            let outcome = Outcome::RestartFailed(e.to_string());
            self.record(&outcome, None);
            return outcome;
        }

        if !self.timing.restart_wait.is_zero() {
            thread::sleep(self.timing.restart_wait);
        }

        let deadline = Instant::now() + self.timing.verify_timeout;
        let mut samples = 0u32;
        let outcome = loop {
            let sample = self.probe.sample();
            samples += 1;
            if sample.is_healthy() {
                break Outcome::Recovered;
            }
            if Instant::now() >= deadline {
                break Outcome::StillUnhealthy;
            }
            thread::sleep(self.timing.verify_poll);
        };

        match &outcome {
            Outcome::Recovered => info!(samples, "service recovered after restart"),
            _ => error!(samples, "service still unhealthy after restart"),
        }
        self.record(&outcome, Some(format!("{} re-sample(s)", samples)));
        outcome
    }

    fn record(&self, outcome: &Outcome, detail: Option<String>) {
        let detail = match outcome {
            Outcome::RestartFailed(reason) => Some(reason.clone()),
            _ => detail,
        };
        self.probe
            .record(&AuditEntry::remediation("restart", outcome.label(), detail));
    }
}

/// Restart only when unhealthy and the caller asked for it
pub fn decide(sample: &HealthSample, auto_remediate: bool) -> RemediationDecision {
    if !sample.is_healthy() && auto_remediate {
        RemediationDecision::RestartAndReverify
    } else {
        RemediationDecision::NoOp
    }
}
