//! Service unit descriptor rendering
//!
//! The unit is generated from `[service]` config rather than shipped as a
//! file, so the install root and base path always match what the steps used.

use crate::config::ServiceConfig;
use crate::fs_util::atomic_write;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("service.exec_start is empty; cannot render a unit for {0}")]
    MissingExecStart(String),

    #[error("failed to write unit {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    pub description: String,
    pub working_directory: PathBuf,
    pub exec_start: String,
    pub restart: String,
    pub restart_sec: u64,
    pub user: Option<String>,
    pub environment: BTreeMap<String, String>,
}

impl UnitDescriptor {
    pub fn from_service(service: &ServiceConfig) -> Result<Self, UnitError> {
        if service.exec_start.trim().is_empty() {
            return Err(UnitError::MissingExecStart(service.name.clone()));
        }
        Ok(Self {
            description: service.description.clone(),
            working_directory: service.working_directory.clone(),
            exec_start: service.exec_start.clone(),
            restart: service.restart_policy.as_str().to_string(),
            restart_sec: service.restart_delay_secs,
            user: service.user.clone(),
            environment: service.environment(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description={}", self.description);
        let _ = writeln!(out, "After=network-online.target");
        let _ = writeln!(out, "Wants=network-online.target");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=simple");
        if let Some(user) = &self.user {
            let _ = writeln!(out, "User={}", user);
        }
        let _ = writeln!(out, "WorkingDirectory={}", self.working_directory.display());
        for (key, value) in &self.environment {
            let _ = writeln!(out, "Environment=\"{}={}\"", key, escape(value));
        }
        let _ = writeln!(out, "ExecStart={}", self.exec_start);
        let _ = writeln!(out, "Restart={}", self.restart);
        let _ = writeln!(out, "RestartSec={}", self.restart_sec);
        let _ = writeln!(out);
        let _ = writeln!(out, "[Install]");
        let _ = writeln!(out, "WantedBy=multi-user.target");
        out
    }

    /// Write the rendered unit; returns true if the file content changed
    pub fn write(&self, path: &Path) -> Result<bool, UnitError> {
        let rendered = self.render();
        if std::fs::read_to_string(path).ok().as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        atomic_write(path, rendered.as_bytes()).map_err(|source| UnitError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "service unit written");
        Ok(true)
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
