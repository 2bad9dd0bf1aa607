//! Health signal acquisition
//!
//! Each signal is gathered independently. A signal that cannot be observed
//! (supervisor call failed, no probe URL, HTTP client error) counts as false
//! and never aborts the sample.

use super::audit::{AuditEntry, AuditLog};
use super::{HealthSample, HealthSignals};
use crate::supervisor::ServiceSupervisor;
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("{signal} unavailable: {reason}")]
    Unavailable {
        signal: &'static str,
        reason: String,
    },
}

impl SignalError {
    fn unavailable(signal: &'static str, reason: impl Into<String>) -> Self {
        SignalError::Unavailable {
            signal,
            reason: reason.into(),
        }
    }
}

/// Looks up running processes
pub trait ProcessTable {
    fn is_running(&self, pattern: &str) -> Result<bool, SignalError>;
}

/// Process table backed by sysinfo
#[derive(Debug, Default)]
pub struct SysinfoProcessTable;

impl ProcessTable for SysinfoProcessTable {
    fn is_running(&self, pattern: &str) -> Result<bool, SignalError> {
        let mut system = System::new();
        system.refresh_processes();
        let found = system.processes().values().any(|process| {
            process.name() == pattern
                || process
                    .cmd()
                    .first()
                    .map(|arg0| arg0 == pattern || arg0.ends_with(&format!("/{}", pattern)))
                    .unwrap_or(false)
        });
        debug!(pattern, found, "process lookup");
        Ok(found)
    }
}

/// Application-level probe
pub trait HttpProbe {
    fn check(&self) -> Result<bool, SignalError>;
}

/// GET the configured URL; any 2xx is healthy
pub struct ReqwestProbe {
    url: Option<String>,
    client: Option<reqwest::blocking::Client>,
}

impl ReqwestProbe {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "http client unavailable, probe signal will be false");
                None
            }
        };
        Self { url, client }
    }
}

impl HttpProbe for ReqwestProbe {
    fn check(&self) -> Result<bool, SignalError> {
        let Some(url) = &self.url else {
            return Err(SignalError::unavailable("probe", "no health.url configured"));
        };
        let Some(client) = &self.client else {
            return Err(SignalError::unavailable("probe", "no http client"));
        };
        match client.get(url).send() {
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "probe response");
                Ok(response.status().is_success())
            }
            Err(e) => Err(SignalError::unavailable("probe", e.to_string())),
        }
    }
}

/// Samples the three signals and records every sample
pub struct HealthProbe<'a> {
    supervisor: &'a dyn ServiceSupervisor,
    processes: &'a dyn ProcessTable,
    http: &'a dyn HttpProbe,
    process_pattern: Option<String>,
    threshold: u8,
    audit: AuditLog,
}

impl<'a> HealthProbe<'a> {
    pub fn new(
        supervisor: &'a dyn ServiceSupervisor,
        processes: &'a dyn ProcessTable,
        http: &'a dyn HttpProbe,
        process_pattern: Option<String>,
        threshold: u8,
        audit: AuditLog,
    ) -> Self {
        Self {
            supervisor,
            processes,
            http,
            process_pattern,
            threshold,
            audit,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn supervisor(&self) -> &dyn ServiceSupervisor {
        self.supervisor
    }

    pub fn sample(&self) -> HealthSample {
        let signals = HealthSignals {
            supervisor_active: downgrade(
                "supervisor_active",
                self.supervisor
                    .is_active()
                    .map_err(|e| SignalError::unavailable("supervisor", e.to_string())),
            ),
            process_present: downgrade("process_present", self.process_present()),
            probe_ok: downgrade("probe_ok", self.http.check()),
        };

        let sample = HealthSample::new(signals, self.threshold);
        info!(
            score = sample.score,
            class = %sample.class,
            supervisor_active = signals.supervisor_active,
            process_present = signals.process_present,
            probe_ok = signals.probe_ok,
            "health sample"
        );
        self.record(&AuditEntry::Sample(sample.clone()));
        sample
    }

    /// Append to the audit log; failure to record never fails the check
    pub fn record(&self, entry: &AuditEntry) {
        if let Err(e) = self.audit.append(entry) {
            warn!(path = %self.audit.path().display(), error = %e, "failed to append audit entry");
        }
    }

    fn process_present(&self) -> Result<bool, SignalError> {
        let Some(pattern) = &self.process_pattern else {
            return Err(SignalError::unavailable(
                "process",
                "no process pattern (set service.process_pattern or exec_start)",
            ));
        };
        self.processes.is_running(pattern)
    }
}

fn downgrade(name: &'static str, result: Result<bool, SignalError>) -> bool {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(signal = name, error = %e, "signal unavailable, counting as false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorError;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct StaticSupervisor(Option<bool>);

    impl ServiceSupervisor for StaticSupervisor {
        fn unit(&self) -> &str {
            "node"
        }
        fn start(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
        fn restart(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
        fn enable(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
        fn reload(&self) -> Result<(), SupervisorError> {
            Ok(())
        }
        fn is_active(&self) -> Result<bool, SupervisorError> {
            self.0.ok_or_else(|| SupervisorError::Command {
                action: "is-active",
                unit: "node".to_string(),
                message: "no bus".to_string(),
            })
        }
        fn main_pid(&self) -> Result<Option<u32>, SupervisorError> {
            Ok(None)
        }
        fn status_text(&self) -> Result<String, SupervisorError> {
            Ok(String::new())
        }
        fn logs(&self, _lines: usize) -> Result<String, SupervisorError> {
            Ok(String::new())
        }
    }

    struct StaticProcesses(bool);

    impl ProcessTable for StaticProcesses {
        fn is_running(&self, _pattern: &str) -> Result<bool, SignalError> {
            Ok(self.0)
        }
    }

    struct CountingProbe {
        ok: bool,
        calls: Cell<u32>,
    }

    impl HttpProbe for CountingProbe {
        fn check(&self) -> Result<bool, SignalError> {
            self.calls.set(self.calls.get() + 1);
            if self.ok {
                Ok(true)
            } else {
                Err(SignalError::unavailable("probe", "connection refused"))
            }
        }
    }

    #[test]
    fn test_sample_all_signals_true() {
        let temp = TempDir::new().unwrap();
        let supervisor = StaticSupervisor(Some(true));
        let processes = StaticProcesses(true);
        let http = CountingProbe { ok: true, calls: Cell::new(0) };
        let probe = HealthProbe::new(
            &supervisor,
            &processes,
            &http,
            Some("node".to_string()),
            2,
            AuditLog::new(temp.path().join("health.log")),
        );
        let sample = probe.sample();
        assert_eq!(sample.score, 3);
        assert!(sample.is_healthy());
        assert_eq!(http.calls.get(), 1);
        assert_eq!(probe.audit().read_all().len(), 1);
    }

    #[test]
    fn test_unavailable_signals_are_false() {
        let temp = TempDir::new().unwrap();
        let supervisor = StaticSupervisor(None);
        let processes = StaticProcesses(true);
        let http = CountingProbe { ok: false, calls: Cell::new(0) };
        let probe = HealthProbe::new(
            &supervisor,
            &processes,
            &http,
            None,
            2,
            AuditLog::new(temp.path().join("health.log")),
        );
        let sample = probe.sample();
        assert_eq!(sample.signals, HealthSignals::all(false));
        assert_eq!(sample.score, 0);
    }

    #[test]
    fn test_probe_without_url_is_unavailable() {
        let probe = ReqwestProbe::new(None, Duration::from_secs(1));
        assert!(probe.check().is_err());
    }

    #[test]
    fn test_audit_failure_does_not_abort_sample() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let supervisor = StaticSupervisor(Some(true));
        let processes = StaticProcesses(true);
        let http = CountingProbe { ok: true, calls: Cell::new(0) };
        let probe = HealthProbe::new(
            &supervisor,
            &processes,
            &http,
            Some("node".to_string()),
            2,
            AuditLog::new(blocker.join("health.log")),
        );
        assert!(probe.sample().is_healthy());
    }
}
