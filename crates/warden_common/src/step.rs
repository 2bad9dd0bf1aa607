//! Step model
//!
//! A step is identified by its ordinal and name; its body is fetched from a
//! remote locator and describes typed actions plus an optional postcondition,
//! so success is judged by exit codes and checks rather than scraped output.
//!
//! Example body:
//!
//! ```toml
//! description = "Install system packages"
//!
//! [[actions]]
//! kind = "wait_for_dns"
//! host = "deb.debian.org"
//!
//! [[actions]]
//! kind = "package_install"
//! packages = ["git", "curl"]
//!
//! [postcondition]
//! kind = "path_exists"
//! path = "/usr/bin/git"
//! ```

use crate::exec::{CommandSpec, ExecError};
use crate::supervisor::SupervisorError;
use crate::unit::UnitError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// One entry of the ordered step list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub ordinal: usize,
    pub name: String,
    /// Where the body is fetched from
    pub locator: String,
}

impl StepSpec {
    pub fn new(ordinal: usize, name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
            locator: locator.into(),
        }
    }
}

/// Parsed step body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBody {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub postcondition: Option<Postcondition>,
}

fn default_dns_port() -> u16 {
    443
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Run one command; non-zero exit fails the step
    Command(CommandSpec),

    /// Block until `host` resolves (retried)
    WaitForDns {
        host: String,
        #[serde(default = "default_dns_port")]
        port: u16,
    },

    /// Install packages, waiting out another process holding the package lock
    PackageInstall { packages: Vec<String> },

    /// Grant trust, reinstall, re-check; run `companion` between rounds
    TrustConverge {
        /// Exit 0 (and no `pending_pattern` in stdout) means converged
        check: CommandSpec,
        grant: CommandSpec,
        reinstall: CommandSpec,
        #[serde(default)]
        companion: Option<CommandSpec>,
        #[serde(default)]
        pending_pattern: Option<String>,
    },

    /// Clone or fast-forward a checkout, falling back to an archive download
    GitSync {
        repo: String,
        dest: PathBuf,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default)]
        archive_url: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    WriteFile {
        path: PathBuf,
        contents: String,
        #[serde(default)]
        mode: Option<u32>,
    },

    /// Render the service unit from config and reload the supervisor
    WriteUnit,

    StartService {
        #[serde(default = "default_true")]
        enable: bool,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Command(_) => "command",
            Action::WaitForDns { .. } => "wait_for_dns",
            Action::PackageInstall { .. } => "package_install",
            Action::TrustConverge { .. } => "trust_converge",
            Action::GitSync { .. } => "git_sync",
            Action::WriteFile { .. } => "write_file",
            Action::WriteUnit => "write_unit",
            Action::StartService { .. } => "start_service",
        }
    }
}

/// What must hold after the actions ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Postcondition {
    PathExists { path: PathBuf },
    CommandSucceeds(CommandSpec),
    ServiceActive,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step body is not valid: {0}")]
    InvalidBody(String),

    #[error("`{command}` exited with {}: {output}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{concern} did not succeed after {attempts} attempts: {last}")]
    RetriesExhausted {
        concern: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("postcondition failed: {0}")]
    Postcondition(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl StepBody {
    /// Parse the TOML body, then expand `${VAR}` placeholders in its strings
    ///
    /// Expansion happens after parsing so values may contain quotes or
    /// backslashes without breaking the document.
    pub fn parse(text: &str, vars: &BTreeMap<String, String>) -> Result<Self, StepError> {
        let mut table: toml::Table =
            toml::from_str(text).map_err(|e| StepError::InvalidBody(e.to_string()))?;
        for (_, value) in table.iter_mut() {
            expand_value(value, vars);
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| StepError::InvalidBody(e.to_string()))
    }
}

fn expand_value(value: &mut toml::Value, vars: &BTreeMap<String, String>) {
    match value {
        toml::Value::String(text) => *text = expand_vars(text, vars),
        toml::Value::Array(items) => items.iter_mut().for_each(|item| expand_value(item, vars)),
        toml::Value::Table(table) => table
            .iter_mut()
            .for_each(|(_, item)| expand_value(item, vars)),
        _ => {}
    }
}

/// Replace `${NAME}` for every NAME in `vars`; unknown placeholders stay as-is
pub fn expand_vars(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
