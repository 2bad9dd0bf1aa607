//! Provisioning orchestrator
//!
//! Drives the ordered step list once under the run lock:
//!
//! ```text
//! NotStarted -> Running(0) -> ... -> Running(n) -> Completed
//!                    \-> Failed(i)
//! ```
//!
//! A step with a marker is skipped without fetching its body. Any failure
//! halts the run at that step; markers of earlier steps stay, so the next
//! invocation resumes exactly there.

use crate::actions::StepExecutor;
use crate::config::Config;
use crate::fetcher::{FetchError, StepFetcher, StepSource};
use crate::lock::{LockError, RunLock};
use crate::markers::{MarkerError, MarkerStore};
use crate::step::{StepBody, StepError, StepSpec};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, info_span};
use uuid::Uuid;

/// Command an operator runs to resume provisioning
pub const SETUP_COMMAND: &str = "warden-setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running(usize),
    Completed,
    Failed(usize),
}

/// Every variant halts the run
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Locked(#[from] LockError),

    #[error("step {index} ({step}): fetching definition failed: {source}")]
    Fetch {
        index: usize,
        step: String,
        #[source]
        source: FetchError,
    },

    #[error("step {index} ({step}) failed: {source}")]
    Step {
        index: usize,
        step: String,
        #[source]
        source: StepError,
    },

    #[error("step {index} ({step}) succeeded but could not be recorded: {source}")]
    Marker {
        index: usize,
        step: String,
        #[source]
        source: MarkerError,
    },
}

impl ProvisionError {
    /// Index and name of the step the run halted at
    pub fn failed_step(&self) -> Option<(usize, &str)> {
        match self {
            ProvisionError::Locked(_) => None,
            ProvisionError::Fetch { index, step, .. }
            | ProvisionError::Step { index, step, .. }
            | ProvisionError::Marker { index, step, .. } => Some((*index, step.as_str())),
        }
    }

    /// What the operator should do next
    pub fn remediation(&self, command: &str, log: &Path) -> String {
        match self {
            ProvisionError::Locked(LockError::AlreadyLocked { path, .. }) => format!(
                "Wait for the running provisioning to finish, or if no run is in progress remove {} and re-run: {}\nLog: {}",
                path.display(),
                command,
                log.display()
            ),
            ProvisionError::Locked(LockError::Io { .. }) => format!(
                "Check permissions on the state directory, then re-run: {}\nLog: {}",
                command,
                log.display()
            ),
            other => {
                let step = other.failed_step().map(|(_, s)| s).unwrap_or("?");
                format!(
                    "Fix the problem above and re-run: {}\nCompleted steps are skipped; the run resumes at step {}.\nLog: {}",
                    command,
                    step,
                    log.display()
                )
            }
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

/// A step and whether it has been completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub step: StepSpec,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Marker state of every configured step, in order
pub fn step_statuses(steps: &[StepSpec], markers: &MarkerStore) -> Vec<StepStatus> {
    steps
        .iter()
        .map(|step| StepStatus {
            step: step.clone(),
            completed_at: markers.get(&step.name).map(|r| r.completed_at),
        })
        .collect()
}

pub struct Orchestrator<S, E> {
    steps: Vec<StepSpec>,
    markers: MarkerStore,
    lock: RunLock,
    fetcher: StepFetcher<S>,
    executor: E,
    vars: BTreeMap<String, String>,
    state: RunState,
}

impl<S: StepSource, E: StepExecutor> Orchestrator<S, E> {
    pub fn new(config: &Config, source: S, executor: E) -> Self {
        let paths = config.state_paths();
        Self {
            steps: config.steps(),
            markers: MarkerStore::new(paths.clone()),
            lock: RunLock::new(paths.lock_file(), config.provision.lock_liveness_check),
            fetcher: StepFetcher::new(source, paths),
            executor,
            vars: config.service.environment(),
            state: RunState::NotStarted,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn fetcher(&self) -> &StepFetcher<S> {
        &self.fetcher
    }

    /// Run every step not yet marked complete, in order
    pub fn run(&mut self) -> Result<RunReport, ProvisionError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("provision", run_id = %run_id);
        let _enter = span.enter();

        self.state = RunState::NotStarted;
        let guard = self.lock.acquire()?;
        info!(steps = self.steps.len(), "provisioning started");

        let result = self.run_steps(run_id);
        guard.release();

        match &result {
            Ok(report) => info!(
                executed = report.executed.len(),
                skipped = report.skipped.len(),
                "provisioning completed"
            ),
            Err(e) => error!(error = %e, "provisioning halted"),
        }
        result
    }

    fn run_steps(&mut self, run_id: Uuid) -> Result<RunReport, ProvisionError> {
        let mut report = RunReport {
            run_id,
            executed: Vec::new(),
            skipped: Vec::new(),
        };

        for index in 0..self.steps.len() {
            self.state = RunState::Running(index);
            let step = self.steps[index].clone();

            if self.markers.has(&step.name) {
                info!(index, step = %step.name, "already complete, skipping");
                report.skipped.push(step.name);
                continue;
            }

            if let Err(e) = self.run_step(index, &step) {
                self.state = RunState::Failed(index);
                return Err(e);
            }
            report.executed.push(step.name);
        }

        self.state = RunState::Completed;
        Ok(report)
    }

    fn run_step(&self, index: usize, step: &StepSpec) -> Result<(), ProvisionError> {
        info!(index, step = %step.name, "running step");

        let fetched = self
            .fetcher
            .fetch(step)
            .map_err(|source| ProvisionError::Fetch {
                index,
                step: step.name.clone(),
                source,
            })?;

        let step_err = |source| ProvisionError::Step {
            index,
            step: step.name.clone(),
            source,
        };
        let body = StepBody::parse(&fetched.text, &self.vars).map_err(step_err)?;
        self.executor.execute(step, &body).map_err(step_err)?;

        self.markers
            .set(&step.name)
            .map_err(|source| ProvisionError::Marker {
                index,
                step: step.name.clone(),
                source,
            })?;
        info!(index, step = %step.name, fingerprint = fetched.fingerprint.short(), "step complete");
        Ok(())
    }
}
