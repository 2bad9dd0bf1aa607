//! Path helpers for Warden
//!
//! Everything Warden persists lives under one state directory:
//!
//! ```text
//! /var/lib/warden/
//!   <step>.done       completion markers, one per step
//!   run.lock          orchestrator lock
//!   cache/<step>.toml last fetched step bodies
//!   health.log        append-only health audit (JSONL)
//!   provision.log     provisioning log
//! ```

use std::path::{Path, PathBuf};

/// Default state directory
pub const DEFAULT_STATE_DIR: &str = "/var/lib/warden";

/// Default config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/warden.toml";

/// Suffix for completion marker files
pub const MARKER_SUFFIX: &str = ".done";

/// Resolved locations under a state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `<step>.done` markers
    pub fn marker_dir(&self) -> PathBuf {
        self.root.clone()
    }

    pub fn marker(&self, step: &str) -> PathBuf {
        self.root.join(format!("{}{}", step, MARKER_SUFFIX))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Cached copy of a step body
    pub fn cached_body(&self, step: &str) -> PathBuf {
        self.cache_dir().join(format!("{}.toml", step))
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("health.log")
    }

    pub fn provision_log(&self) -> PathBuf {
        self.root.join("provision.log")
    }
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::with_root(DEFAULT_STATE_DIR)
    }
}
