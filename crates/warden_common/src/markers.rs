//! Step completion markers
//!
//! A marker is a durable "step X done" fact: one `<step>.done` file in the
//! state directory. Markers are written only after a step body succeeds and
//! are never removed by the orchestrator; `clear` exists for the operator's
//! `warden-setup --reset <step>`.

use crate::config::is_valid_step_name;
use crate::fs_util::atomic_write;
use crate::paths::{StatePaths, MARKER_SUFFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("invalid step name {0:?}")]
    InvalidStep(String),

    #[error("failed to record completion of step {step} at {}: {source}", .path.display())]
    Write {
        step: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to clear marker for step {step} at {}: {source}", .path.display())]
    Clear {
        step: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Contents of a marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub step: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    paths: StatePaths,
}

impl MarkerStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    pub fn has(&self, step: &str) -> bool {
        is_valid_step_name(step) && self.paths.marker(step).is_file()
    }

    /// Record completion; a second call for the same step changes nothing
    pub fn set(&self, step: &str) -> Result<(), MarkerError> {
        if !is_valid_step_name(step) {
            return Err(MarkerError::InvalidStep(step.to_string()));
        }
        if self.has(step) {
            debug!(step, "marker already present");
            return Ok(());
        }

        let path = self.paths.marker(step);
        let record = MarkerRecord {
            step: step.to_string(),
            completed_at: Utc::now(),
        };
        let written = serde_json::to_vec_pretty(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|body| atomic_write(&path, &body));

        match written {
            Ok(()) => {
                info!(step, path = %path.display(), "step marked complete");
                Ok(())
            }
            Err(source) => Err(MarkerError::Write {
                step: step.to_string(),
                path,
                source,
            }),
        }
    }

    /// Remove a marker so exactly that step runs again; returns whether it existed
    pub fn clear(&self, step: &str) -> Result<bool, MarkerError> {
        if !is_valid_step_name(step) {
            return Err(MarkerError::InvalidStep(step.to_string()));
        }
        let path = self.paths.marker(step);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(step, "marker cleared");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(MarkerError::Clear {
                step: step.to_string(),
                path,
                source,
            }),
        }
    }

    /// Read a marker's record, if present and readable
    pub fn get(&self, step: &str) -> Option<MarkerRecord> {
        if !self.has(step) {
            return None;
        }
        let content = fs::read_to_string(self.paths.marker(step)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// All step names that currently have a marker, sorted
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.paths.marker_dir()) else {
            return Vec::new();
        };
        let mut steps: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(MARKER_SUFFIX))
                    .map(str::to_string)
            })
            .collect();
        steps.sort();
        steps
    }
}
