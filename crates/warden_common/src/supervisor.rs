//! Service supervisor interface
//!
//! The orchestrator's service steps and the health/remediation engine talk
//! to the host's init system through this trait. `Systemd` is the only real
//! implementation; every call is a bounded `systemctl`/`journalctl` command.

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{action} {unit} failed: {message}")]
    Command {
        action: &'static str,
        unit: String,
        message: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Operations the engine needs from the init system
pub trait ServiceSupervisor {
    fn unit(&self) -> &str;

    fn start(&self) -> Result<(), SupervisorError>;

    fn stop(&self) -> Result<(), SupervisorError>;

    fn restart(&self) -> Result<(), SupervisorError>;

    /// Start automatically at boot
    fn enable(&self) -> Result<(), SupervisorError>;

    /// Re-read unit descriptors after one was written
    fn reload(&self) -> Result<(), SupervisorError>;

    /// "Active" as the supervisor reports it
    fn is_active(&self) -> Result<bool, SupervisorError>;

    /// PID of the main process, if running
    fn main_pid(&self) -> Result<Option<u32>, SupervisorError>;

    /// Human-readable status block
    fn status_text(&self) -> Result<String, SupervisorError>;

    /// Last `lines` lines of the service log
    fn logs(&self, lines: usize) -> Result<String, SupervisorError>;
}

/// systemd via `systemctl` and `journalctl`
pub struct Systemd<R> {
    unit: String,
    runner: R,
}

impl<R: CommandRunner> Systemd<R> {
    pub fn new(unit: impl Into<String>, runner: R) -> Self {
        Self {
            unit: unit.into(),
            runner,
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<CommandOutput, SupervisorError> {
        let spec = CommandSpec::new("systemctl", args.iter().copied());
        Ok(self.runner.run(&spec)?)
    }

    fn checked(&self, action: &'static str, args: &[&str]) -> Result<(), SupervisorError> {
        info!(unit = %self.unit, action, "systemctl");
        let output = self.systemctl(args)?;
        if output.success {
            Ok(())
        } else {
            warn!(unit = %self.unit, action, code = ?output.code, "systemctl failed");
            Err(SupervisorError::Command {
                action,
                unit: self.unit.clone(),
                message: output.summary(),
            })
        }
    }
}

impl<R: CommandRunner> ServiceSupervisor for Systemd<R> {
    fn unit(&self) -> &str {
        &self.unit
    }

    fn start(&self) -> Result<(), SupervisorError> {
        self.checked("start", &["start", &self.unit])
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        self.checked("stop", &["stop", &self.unit])
    }

    fn restart(&self) -> Result<(), SupervisorError> {
        self.checked("restart", &["restart", &self.unit])
    }

    fn enable(&self) -> Result<(), SupervisorError> {
        self.checked("enable", &["enable", &self.unit])
    }

    fn reload(&self) -> Result<(), SupervisorError> {
        self.checked("daemon-reload", &["daemon-reload"])
    }

    fn is_active(&self) -> Result<bool, SupervisorError> {
        // Non-zero exit just means "not active"; only a failed spawn is an error
        let output = self.systemctl(&["is-active", &self.unit])?;
        let state = output.stdout.trim();
        debug!(unit = %self.unit, state, "is-active");
        Ok(output.success && state == "active")
    }

    fn main_pid(&self) -> Result<Option<u32>, SupervisorError> {
        let output = self.systemctl(&["show", "-p", "MainPID", "--value", &self.unit])?;
        if !output.success {
            return Ok(None);
        }
        Ok(parse_main_pid(&output.stdout))
    }

    fn status_text(&self) -> Result<String, SupervisorError> {
        // `status` exits 3 for inactive units but still prints the block
        let output = self.systemctl(&["status", "--no-pager", &self.unit])?;
        if output.stdout.trim().is_empty() && !output.success {
            return Err(SupervisorError::Command {
                action: "status",
                unit: self.unit.clone(),
                message: output.summary(),
            });
        }
        Ok(output.stdout)
    }

    fn logs(&self, lines: usize) -> Result<String, SupervisorError> {
        let count = lines.to_string();
        let spec = CommandSpec::new(
            "journalctl",
            ["-u", self.unit.as_str(), "-n", count.as_str(), "--no-pager"],
        );
        let output = self.runner.run(&spec)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(SupervisorError::Command {
                action: "logs",
                unit: self.unit.clone(),
                message: output.summary(),
            })
        }
    }
}

/// `MainPID=0` (or empty) means no main process
fn parse_main_pid(text: &str) -> Option<u32> {
    let value = text.trim();
    let value = value.strip_prefix("MainPID=").unwrap_or(value);
    match value.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(pid) => Some(pid),
    }
}
