//! Health audit log
//!
//! Append-only JSONL at `<state_dir>/health.log`. One line per health sample
//! and one per remediation outcome. Single writer; lines that fail to parse
//! are skipped on read.

use super::HealthSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Sample(HealthSample),
    Remediation {
        timestamp: DateTime<Utc>,
        action: String,
        outcome: String,
        detail: Option<String>,
    },
}

impl AuditEntry {
    pub fn remediation(
        action: impl Into<String>,
        outcome: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        AuditEntry::Remediation {
            timestamp: Utc::now(),
            action: action.into(),
            outcome: outcome.into(),
            detail,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEntry::Sample(s) => s.timestamp,
            AuditEntry::Remediation { timestamp, .. } => *timestamp,
        }
    }

    /// One line for terminal output
    pub fn describe(&self) -> String {
        match self {
            AuditEntry::Sample(s) => format!(
                "sample score={}/3 {} (supervisor={} process={} probe={})",
                s.score,
                s.class,
                s.signals.supervisor_active,
                s.signals.process_present,
                s.signals.probe_ok
            ),
            AuditEntry::Remediation {
                action,
                outcome,
                detail,
                ..
            } => match detail {
                Some(d) => format!("{} -> {} ({})", action, outcome, d),
                None => format!("{} -> {}", action, outcome),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    pub fn read_all(&self) -> Vec<AuditEntry> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    /// Last `count` entries, oldest first
    pub fn read_recent(&self, count: usize) -> Vec<AuditEntry> {
        let all = self.read_all();
        let skip = all.len().saturating_sub(count);
        all.into_iter().skip(skip).collect()
    }
}
