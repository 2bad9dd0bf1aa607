//! CLI - Command-line argument parsing for wardenctl

use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// Default number of log lines for a bare `--logs`
pub const DEFAULT_LOG_LINES: usize = 50;

/// Operate the managed service
#[derive(Parser, Debug)]
#[command(name = "wardenctl")]
#[command(about = "Warden control - status, logs, health and restart of the managed service", long_about = None)]
#[command(version = env!("WARDEN_VERSION"))]
#[command(group(ArgGroup::new("action").args(["status", "logs", "health", "restart"])))]
pub struct Cli {
    /// Config file (overrides $WARDEN_CONFIG and /etc/warden/warden.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Supervisor status, provisioning progress and recent health audit
    #[arg(long)]
    pub status: bool,

    /// Show the last N lines of the service log
    #[arg(
        long,
        value_name = "N",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "50"
    )]
    pub logs: Option<usize>,

    /// Score the service; exits 2 when unhealthy
    #[arg(long)]
    pub health: bool,

    /// With a health check: restart once and re-verify if unhealthy
    #[arg(long, conflicts_with_all = ["status", "logs", "restart"])]
    pub autorestart: bool,

    /// Restart the service and verify it comes back healthy
    #[arg(long)]
    pub restart: bool,
}

/// What a parsed command line asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Status,
    Logs(usize),
    Health { auto_remediate: bool },
    Restart,
}

impl Cli {
    pub fn action(&self) -> Action {
        if let Some(lines) = self.logs {
            Action::Logs(lines)
        } else if self.health || self.autorestart {
            Action::Health {
                auto_remediate: self.autorestart,
            }
        } else if self.restart {
            Action::Restart
        } else {
            Action::Status
        }
    }
}
