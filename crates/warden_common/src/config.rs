//! Warden Configuration
//!
//! Config file: `--config <path>`, `$WARDEN_CONFIG`, or /etc/warden/warden.toml.
//! Every field has a default so a missing file yields a usable config for
//! read-only commands like `wardenctl --status`.

use crate::paths::{StatePaths, DEFAULT_CONFIG_PATH, DEFAULT_STATE_DIR};
use crate::retry::{Backoff, RetryPolicy};
use crate::step::StepSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an alternate config file
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Environment variable carrying the service's base network path
pub const BASE_PATH_VAR: &str = "BASE_PATH";

/// Environment variable carrying the install root
pub const INSTALL_ROOT_VAR: &str = "INSTALL_ROOT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service.name must not be empty")]
    EmptyServiceName,

    #[error("health.threshold must be between 1 and 3, got {0}")]
    ThresholdOutOfRange(u8),

    #[error("step name {0:?} is not a valid file name")]
    InvalidStepName(String),

    #[error("step {0:?} is listed more than once")]
    DuplicateStep(String),

    #[error("retry.{0} must be at least 1")]
    ZeroAttempts(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

/// Supervisor restart policy written into the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    No,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::No => "no",
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::Always
    }
}

/// The managed service and its unit descriptor fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub description: String,
    pub unit_path: PathBuf,
    pub working_directory: PathBuf,
    pub exec_start: String,
    pub restart_policy: RestartPolicy,
    pub restart_delay_secs: u64,
    pub base_path: String,
    pub install_root: PathBuf,
    pub user: Option<String>,
    /// Process name to look for; defaults to the program in `exec_start`
    pub process_pattern: Option<String>,
    pub environment: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "warden-node".to_string(),
            description: "Warden managed node".to_string(),
            unit_path: PathBuf::from("/etc/systemd/system/warden-node.service"),
            working_directory: PathBuf::from("/opt/warden-node"),
            exec_start: String::new(),
            restart_policy: RestartPolicy::Always,
            restart_delay_secs: 5,
            base_path: "/".to_string(),
            install_root: PathBuf::from("/opt/warden-node"),
            user: None,
            process_pattern: None,
            environment: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Full environment for the unit: BASE_PATH, INSTALL_ROOT, then extras
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.environment.clone();
        env.insert(BASE_PATH_VAR.to_string(), self.base_path.clone());
        env.insert(
            INSTALL_ROOT_VAR.to_string(),
            self.install_root.display().to_string(),
        );
        env
    }

    /// Name of the process that should be running when the service is up
    pub fn process_pattern(&self) -> Option<String> {
        if let Some(pattern) = &self.process_pattern {
            return Some(pattern.clone());
        }
        let program = self.exec_start.split_whitespace().next()?;
        Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Application probe URL; no URL means the probe signal is always false
    pub url: Option<String>,
    pub http_timeout_secs: u64,
    /// Minimum number of true signals for "healthy"
    pub threshold: u8,
    /// Pause after issuing a restart before the first re-sample
    pub restart_wait_secs: u64,
    /// Window in which the re-sample must come back healthy
    pub verify_timeout_secs: u64,
    pub verify_poll_secs: u64,
    /// Bound on each supervisor call
    pub command_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            url: None,
            http_timeout_secs: 5,
            threshold: 2,
            restart_wait_secs: 5,
            verify_timeout_secs: 30,
            verify_poll_secs: 3,
            command_timeout_secs: 30,
        }
    }
}

/// One entry in the ordered step list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEntry {
    pub name: String,
    /// Explicit locator; defaults to `<steps_base_url>/<name>.toml`
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub steps_base_url: String,
    pub fetch_timeout_secs: u64,
    /// Reclaim a lock whose owning process is gone
    pub lock_liveness_check: bool,
    pub default_command_timeout_secs: u64,
    /// argv prefix used by `package_install` actions
    pub package_install: Vec<String>,
    pub steps: Vec<StepEntry>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            steps_base_url: String::new(),
            fetch_timeout_secs: 30,
            lock_liveness_check: true,
            default_command_timeout_secs: 900,
            package_install: vec![
                "apt-get".to_string(),
                "install".to_string(),
                "-y".to_string(),
            ],
            steps: Vec::new(),
        }
    }
}

/// Attempts and linear backoff base for each transient concern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub dns_attempts: u32,
    pub dns_backoff_secs: u64,
    pub package_lock_attempts: u32,
    pub package_lock_backoff_secs: u64,
    pub trust_attempts: u32,
    pub trust_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            dns_attempts: 30,
            dns_backoff_secs: 2,
            package_lock_attempts: 20,
            package_lock_backoff_secs: 5,
            trust_attempts: 3,
            trust_backoff_secs: 2,
        }
    }
}

impl RetryConfig {
    pub fn dns(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dns_attempts,
            Backoff::Linear(Duration::from_secs(self.dns_backoff_secs)),
        )
    }

    pub fn package_lock(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.package_lock_attempts,
            Backoff::Linear(Duration::from_secs(self.package_lock_backoff_secs)),
        )
    }

    pub fn trust(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.trust_attempts,
            Backoff::Linear(Duration::from_secs(self.trust_backoff_secs)),
        )
    }
}

/// Main Warden configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub service: ServiceConfig,
    pub health: HealthConfig,
    pub provision: ProvisionConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Resolve which file to read: explicit path, then $WARDEN_CONFIG, then /etc
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load and validate configuration
    ///
    /// An explicitly named file must exist; the default location may be
    /// absent, in which case defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        let must_exist = explicit.is_some() || std::env::var_os(CONFIG_ENV).is_some();

        let config = if path.exists() {
            Self::from_file(&path)?
        } else if must_exist {
            anyhow::bail!("Config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        if !(1..=3).contains(&self.health.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.health.threshold));
        }

        let mut seen = HashSet::new();
        for entry in &self.provision.steps {
            if !is_valid_step_name(&entry.name) {
                return Err(ConfigError::InvalidStepName(entry.name.clone()));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateStep(entry.name.clone()));
            }
        }

        for (field, attempts) in [
            ("dns_attempts", self.retry.dns_attempts),
            ("package_lock_attempts", self.retry.package_lock_attempts),
            ("trust_attempts", self.retry.trust_attempts),
        ] {
            if attempts == 0 {
                return Err(ConfigError::ZeroAttempts(field));
            }
        }
        Ok(())
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::with_root(&self.paths.state_dir)
    }

    /// Ordered step list with locators resolved
    pub fn steps(&self) -> Vec<StepSpec> {
        let base = self.provision.steps_base_url.trim_end_matches('/');
        self.provision
            .steps
            .iter()
            .enumerate()
            .map(|(ordinal, entry)| {
                let locator = entry
                    .source
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}.toml", base, entry.name));
                StepSpec::new(ordinal, &entry.name, locator)
            })
            .collect()
    }
}

/// Step names become file names, so keep them to a safe alphabet
pub fn is_valid_step_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
state_dir = "/tmp/warden-test"

[service]
name = "lens-node"
exec_start = "/opt/lens/bin/lens-node --port 8080"
base_path = "/lens"
install_root = "/opt/lens"
restart_delay_secs = 10

[service.environment]
NODE_ENV = "production"

[health]
url = "http://127.0.0.1:8080/health"

[provision]
steps_base_url = "https://example.com/steps/"

[[provision.steps]]
name = "01-packages"

[[provision.steps]]
name = "02-checkout"
source = "https://mirror.example.com/checkout.toml"
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.threshold, 2);
        assert!(config.provision.lock_liveness_check);
    }

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.service.name, "lens-node");
        assert_eq!(config.service.restart_delay_secs, 10);
        assert_eq!(config.service.restart_policy, RestartPolicy::Always);
        assert_eq!(
            config.health.url.as_deref(),
            Some("http://127.0.0.1:8080/health")
        );
    }

    #[test]
    fn test_step_locators() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let steps = config.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].ordinal, 0);
        assert_eq!(steps[0].locator, "https://example.com/steps/01-packages.toml");
        assert_eq!(steps[1].ordinal, 1);
        assert_eq!(steps[1].locator, "https://mirror.example.com/checkout.toml");
    }

    #[test]
    fn test_environment_includes_required_vars() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let env = config.service.environment();
        assert_eq!(env.get(BASE_PATH_VAR).map(String::as_str), Some("/lens"));
        assert_eq!(env.get(INSTALL_ROOT_VAR).map(String::as_str), Some("/opt/lens"));
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("production"));
    }

    #[test]
    fn test_process_pattern_from_exec_start() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.service.process_pattern().as_deref(), Some("lens-node"));

        let mut service = ServiceConfig::default();
        assert_eq!(service.process_pattern(), None);
        service.process_pattern = Some("node".to_string());
        assert_eq!(service.process_pattern().as_deref(), Some("node"));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.health.threshold = 4;
        assert_eq!(config.validate(), Err(ConfigError::ThresholdOutOfRange(4)));
        config.health.threshold = 0;
        assert_eq!(config.validate(), Err(ConfigError::ThresholdOutOfRange(0)));
    }

    #[test]
    fn test_validate_rejects_duplicate_and_unsafe_steps() {
        let mut config = Config::default();
        config.provision.steps = vec![
            StepEntry { name: "a".to_string(), source: None },
            StepEntry { name: "a".to_string(), source: None },
        ];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateStep("a".to_string()))
        );

        config.provision.steps = vec![StepEntry {
            name: "../etc".to_string(),
            source: None,
        }];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStepName(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.trust_attempts = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroAttempts("trust_attempts"))
        );
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("warden.toml");
        fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.paths.state_dir, PathBuf::from("/tmp/warden-test"));
    }
}
