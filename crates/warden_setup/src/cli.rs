//! CLI - Command-line argument parsing for warden-setup

use clap::Parser;
use std::path::PathBuf;

/// Provision the managed service, resuming after the last completed step
#[derive(Parser, Debug)]
#[command(name = "warden-setup")]
#[command(about = "Warden provisioning - run the ordered setup steps", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (overrides $WARDEN_CONFIG and /etc/warden/warden.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// List configured steps and their completion state, then exit
    #[arg(long, conflicts_with = "reset")]
    pub list: bool,

    /// Clear the completion marker of one step so the next run repeats it
    #[arg(long, value_name = "STEP")]
    pub reset: Option<String>,
}

impl Cli {
    /// Command line that re-runs provisioning with the same config
    pub fn resume_command(&self) -> String {
        match &self.config {
            Some(path) => format!("warden-setup --config {}", path.display()),
            None => "warden-setup".to_string(),
        }
    }
}
