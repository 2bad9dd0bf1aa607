//! Warden Common - provisioning state machine and health remediation
//!
//! Provisioning: ordered, idempotent steps with durable markers, a host-wide
//! run lock and fingerprint-checked step definitions.
//! Operation: three-signal health scoring with bounded restart remediation.

pub mod actions;
pub mod config;
pub mod exec;
pub mod fetcher;
pub mod fs_util;
pub mod health;
pub mod lock;
pub mod markers;
pub mod orchestrator;
pub mod paths;
pub mod remediation;
pub mod retry;
pub mod step;
pub mod supervisor;
pub mod unit;

pub use actions::{ActionExecutor, Resolver, StepExecutor, SystemResolver};
pub use config::{Config, ConfigError};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, ExecError, ProcessGroups, SystemRunner};
pub use fetcher::{DefaultStepSource, FetchError, Fingerprint, StepFetcher, StepSource};
pub use health::audit::{AuditEntry, AuditLog};
pub use health::probe::{HealthProbe, HttpProbe, ProcessTable, ReqwestProbe, SysinfoProcessTable};
pub use health::{HealthClass, HealthSample, HealthSignals};
pub use lock::{LockError, RunLock};
pub use markers::{MarkerError, MarkerStore};
pub use orchestrator::{Orchestrator, ProvisionError, RunReport, RunState};
pub use paths::StatePaths;
pub use remediation::{Outcome, RemediationController, RemediationDecision, RemediationTiming};
pub use retry::{Backoff, RetryPolicy};
pub use step::{StepBody, StepError, StepSpec};
pub use supervisor::{ServiceSupervisor, Systemd};
