//! Step action execution
//!
//! Runs the typed actions of a step body in order and then checks the
//! postcondition. Transient environmental failures (name resolution, package
//! lock contention, dependency trust) go through `RetryPolicy`; anything
//! else fails the step on the spot.

use crate::config::Config;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::fs_util::atomic_write;
use crate::retry::{Backoff, RetryPolicy};
use crate::step::{Action, Postcondition, StepBody, StepError, StepSpec};
use crate::supervisor::ServiceSupervisor;
use crate::unit::UnitDescriptor;
use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// stderr fragments printed by apt/dpkg when another process holds the lock
const PACKAGE_LOCK_PATTERNS: &[&str] = &[
    "Could not get lock",
    "Unable to acquire the dpkg frontend lock",
    "is another process using it",
    "Unable to lock the administration directory",
];

/// Executes one step body
pub trait StepExecutor {
    fn execute(&self, step: &StepSpec, body: &StepBody) -> Result<(), StepError>;
}

impl<T: StepExecutor + ?Sized> StepExecutor for &T {
    fn execute(&self, step: &StepSpec, body: &StepBody) -> Result<(), StepError> {
        (**self).execute(step, body)
    }
}

/// Name resolution, behind a trait so DNS waits can be tested offline
pub trait Resolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<()> {
        let mut addrs = (host, port).to_socket_addrs()?;
        match addrs.next() {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", host),
            )),
        }
    }
}

/// The real executor: commands, supervisor, resolver and service config
pub struct ActionExecutor<'a> {
    runner: &'a dyn CommandRunner,
    supervisor: &'a dyn ServiceSupervisor,
    resolver: &'a dyn Resolver,
    config: &'a Config,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        supervisor: &'a dyn ServiceSupervisor,
        resolver: &'a dyn Resolver,
        config: &'a Config,
    ) -> Self {
        Self {
            runner,
            supervisor,
            resolver,
            config,
        }
    }

    pub fn run_action(&self, action: &Action) -> Result<(), StepError> {
        match action {
            Action::Command(spec) => self.command(spec).map(|_| ()),
            Action::WaitForDns { host, port } => self.wait_for_dns(host, *port),
            Action::PackageInstall { packages } => self.package_install(packages),
            Action::TrustConverge {
                check,
                grant,
                reinstall,
                companion,
                pending_pattern,
            } => self.trust_converge(
                check,
                grant,
                reinstall,
                companion.as_ref(),
                pending_pattern.as_deref(),
            ),
            Action::GitSync {
                repo,
                dest,
                branch,
                archive_url,
                timeout_secs,
            } => self.git_sync(repo, dest, branch, archive_url.as_deref(), *timeout_secs),
            Action::WriteFile {
                path,
                contents,
                mode,
            } => write_file(path, contents, *mode),
            Action::WriteUnit => self.write_unit(),
            Action::StartService { enable } => self.start_service(*enable),
        }
    }

    /// Run a command with the service environment; non-zero exit is an error
    fn command(&self, spec: &CommandSpec) -> Result<CommandOutput, StepError> {
        let mut spec = spec.clone();
        for (key, value) in self.config.service.environment() {
            spec.env.entry(key).or_insert(value);
        }
        let output = self.runner.run(&spec)?;
        if output.success {
            Ok(output)
        } else {
            Err(StepError::CommandFailed {
                command: spec.to_string(),
                code: output.code,
                output: output.summary(),
            })
        }
    }

    fn wait_for_dns(&self, host: &str, port: u16) -> Result<(), StepError> {
        let policy = self.config.retry.dns();
        let outcome = policy.run(|attempt| {
            self.resolver.resolve(host, port).map_err(|e| {
                info!(host, attempt, error = %e, "waiting for name resolution");
                e
            })
        });
        let attempts = outcome.attempts;
        outcome.into_result().map_err(|e| StepError::RetriesExhausted {
            concern: "name resolution",
            attempts,
            last: format!("{}: {}", host, e),
        })?;
        info!(host, attempts, "name resolution ready");
        Ok(())
    }

    fn package_install(&self, packages: &[String]) -> Result<(), StepError> {
        if packages.is_empty() {
            return Ok(());
        }
        let argv = &self.config.provision.package_install;
        let Some((program, prefix)) = argv.split_first() else {
            return Err(StepError::InvalidBody(
                "provision.package_install is empty".to_string(),
            ));
        };
        let spec = CommandSpec::new(program.clone(), prefix.iter().chain(packages).cloned());

        let policy = self.config.retry.package_lock();
        let outcome = policy.run_if(
            |attempt| {
                self.command(&spec).map_err(|e| {
                    if is_package_lock_contention(&e) {
                        warn!(attempt, "package manager lock held by another process");
                    }
                    e
                })
            },
            is_package_lock_contention,
        );

        let attempts = outcome.attempts;
        match outcome.into_result() {
            Ok(_) => {
                info!(packages = ?packages, attempts, "packages installed");
                Ok(())
            }
            Err(e) if is_package_lock_contention(&e) => Err(StepError::RetriesExhausted {
                concern: "package manager lock",
                attempts,
                last: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn trust_converge(
        &self,
        check: &CommandSpec,
        grant: &CommandSpec,
        reinstall: &CommandSpec,
        companion: Option<&CommandSpec>,
        pending_pattern: Option<&str>,
    ) -> Result<(), StepError> {
        if self.trust_converged(check, pending_pattern)? {
            info!("dependency trust already converged");
            return Ok(());
        }

        let policy = self.config.retry.trust();
        let outcome = policy.run_with_hook(
            |attempt| {
                info!(attempt, "granting dependency trust");
                self.command(grant)?;
                self.command(reinstall)?;
                if self.trust_converged(check, pending_pattern)? {
                    Ok(())
                } else {
                    Err(StepError::Postcondition(format!(
                        "`{}` still reports pending work",
                        check
                    )))
                }
            },
            |attempt, err| {
                let Some(companion) = companion else {
                    return;
                };
                warn!(attempt, error = %err, companion = %companion, "trust not converged, re-running companion installer");
                if let Err(e) = self.command(companion) {
                    warn!(error = %e, "companion installer failed");
                }
            },
        );

        let attempts = outcome.attempts;
        outcome
            .into_result()
            .map_err(|e| StepError::RetriesExhausted {
                concern: "dependency trust",
                attempts,
                last: e.to_string(),
            })?;
        info!(attempts, "dependency trust converged");
        Ok(())
    }

    fn trust_converged(
        &self,
        check: &CommandSpec,
        pending_pattern: Option<&str>,
    ) -> Result<bool, StepError> {
        let mut spec = check.clone();
        for (key, value) in self.config.service.environment() {
            spec.env.entry(key).or_insert(value);
        }
        let output = self.runner.run(&spec)?;
        let pending = pending_pattern
            .map(|p| output.stdout.contains(p))
            .unwrap_or(false);
        Ok(output.success && !pending)
    }

    fn git_sync(
        &self,
        repo: &str,
        dest: &Path,
        branch: &str,
        archive_url: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<(), StepError> {
        let timeout = Duration::from_secs(
            timeout_secs.unwrap_or(self.config.provision.default_command_timeout_secs),
        );

        let primary = if dest.join(".git").is_dir() {
            self.git_update(dest, branch, timeout)
        } else {
            self.git_clone(repo, dest, branch, timeout)
        };

        match (primary, archive_url) {
            (Ok(()), _) => Ok(()),
            (Err(e), Some(url)) => {
                warn!(repo, error = %e, "version-control sync failed, falling back to archive");
                self.archive_fallback(url, dest, timeout)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn git(&self, args: &[&str], timeout: Duration) -> Result<(), StepError> {
        let mut spec = CommandSpec::new("git", args.iter().copied()).with_timeout(timeout);
        // Never wait on a credential prompt
        spec.env
            .insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        self.command(&spec).map(|_| ())
    }

    fn git_clone(&self, repo: &str, dest: &Path, branch: &str, timeout: Duration) -> Result<(), StepError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| StepError::Io {
                context: format!("creating {}", parent.display()),
                source,
            })?;
        }
        let dest = dest.display().to_string();
        info!(repo, dest = %dest, branch, "cloning");
        self.git(&["clone", "--branch", branch, repo, &dest], timeout)
    }

    fn git_update(&self, dest: &Path, branch: &str, timeout: Duration) -> Result<(), StepError> {
        let dir = dest.display().to_string();
        let remote_head = format!("origin/{}", branch);
        info!(dest = %dir, branch, "fetching and resetting to remote head");
        self.git(&["-C", &dir, "fetch", "origin", branch], timeout)?;
        self.git(&["-C", &dir, "reset", "--hard", &remote_head], timeout)
    }

    fn archive_fallback(&self, url: &str, dest: &Path, timeout: Duration) -> Result<(), StepError> {
        let archive = std::env::temp_dir().join(format!("warden-{}.tar.gz", uuid::Uuid::new_v4()));
        let archive_str = archive.display().to_string();
        let dest_str = dest.display().to_string();

        fs::create_dir_all(dest).map_err(|source| StepError::Io {
            context: format!("creating {}", dest.display()),
            source,
        })?;

        let download = CommandSpec::new("curl", ["-fsSL", "-o", archive_str.as_str(), url])
            .with_timeout(timeout);
        let extract = CommandSpec::new(
            "tar",
            ["-xzf", archive_str.as_str(), "-C", dest_str.as_str(), "--strip-components=1"],
        )
        .with_timeout(timeout);

        let result = self
            .command(&download)
            .and_then(|_| self.command(&extract))
            .map(|_| ());
        let _ = fs::remove_file(&archive);
        if result.is_ok() {
            info!(url, dest = %dest_str, "archive extracted");
        }
        result
    }

    fn write_unit(&self) -> Result<(), StepError> {
        let service = &self.config.service;
        let unit = UnitDescriptor::from_service(service)?;
        if unit.write(&service.unit_path)? {
            self.supervisor.reload()?;
        }
        Ok(())
    }

    fn start_service(&self, enable: bool) -> Result<(), StepError> {
        if enable {
            self.supervisor.enable()?;
        }
        if self.supervisor.is_active()? {
            self.supervisor.restart()?;
        } else {
            self.supervisor.start()?;
        }
        Ok(())
    }

    fn check_postcondition(&self, postcondition: &Postcondition) -> Result<(), StepError> {
        match postcondition {
            Postcondition::PathExists { path } => {
                if path.exists() {
                    Ok(())
                } else {
                    Err(StepError::Postcondition(format!(
                        "{} does not exist",
                        path.display()
                    )))
                }
            }
            Postcondition::CommandSucceeds(spec) => self
                .command(spec)
                .map(|_| ())
                .map_err(|e| StepError::Postcondition(e.to_string())),
            Postcondition::ServiceActive => {
                // Give a freshly started service the verify window to settle
                let health = &self.config.health;
                let poll = health.verify_poll_secs.max(1);
                let attempts = (health.verify_timeout_secs / poll).max(1) as u32;
                let policy = RetryPolicy::new(attempts, Backoff::Fixed(Duration::from_secs(poll)));
                let outcome = policy.run(|_| match self.supervisor.is_active() {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("inactive".to_string()),
                    Err(e) => Err(e.to_string()),
                });
                outcome.into_result().map_err(|state| {
                    StepError::Postcondition(format!(
                        "service {} is not active ({})",
                        self.supervisor.unit(),
                        state
                    ))
                })
            }
        }
    }
}

impl StepExecutor for ActionExecutor<'_> {
    fn execute(&self, step: &StepSpec, body: &StepBody) -> Result<(), StepError> {
        if !body.description.is_empty() {
            info!(step = %step.name, "{}", body.description);
        }
        for (index, action) in body.actions.iter().enumerate() {
            info!(step = %step.name, action = action.kind(), index, "running action");
            self.run_action(action)?;
        }
        if let Some(postcondition) = &body.postcondition {
            self.check_postcondition(postcondition)?;
        }
        Ok(())
    }
}

fn is_package_lock_contention(err: &StepError) -> bool {
    match err {
        StepError::CommandFailed { output, .. } => {
            PACKAGE_LOCK_PATTERNS.iter().any(|p| output.contains(p))
        }
        _ => false,
    }
}

fn write_file(path: &Path, contents: &str, mode: Option<u32>) -> Result<(), StepError> {
    atomic_write(path, contents.as_bytes()).map_err(|source| StepError::Io {
        context: format!("writing {}", path.display()),
        source,
    })?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
            StepError::Io {
                context: format!("setting mode {:o} on {}", mode, path.display()),
                source,
            }
        })?;
    }
    info!(path = %path.display(), "file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecError;
    use crate::supervisor::SupervisorError;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    type Script = Box<dyn Fn(&str, usize) -> (i32, &'static str)>;

    /// Answers by command line and how often that line has run before
    struct FakeRunner {
        script: Script,
        calls: RefCell<Vec<String>>,
    }

    impl FakeRunner {
        fn new(script: impl Fn(&str, usize) -> (i32, &'static str) + 'static) -> Self {
            Self {
                script: Box::new(script),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn count(&self, line: &str) -> usize {
            self.calls.borrow().iter().filter(|c| c.as_str() == line).count()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
            let line = spec.to_string();
            let seen = self.count(&line);
            self.calls.borrow_mut().push(line.clone());
            let (code, text) = (self.script)(&line, seen);
            Ok(CommandOutput {
                code: Some(code),
                success: code == 0,
                stdout: if code == 0 { text.to_string() } else { String::new() },
                stderr: if code == 0 { String::new() } else { text.to_string() },
            })
        }
    }

    #[derive(Default)]
    struct FakeSupervisor {
        active: Cell<bool>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl FakeSupervisor {
        fn record(&self, call: &'static str) -> Result<(), SupervisorError> {
            self.calls.borrow_mut().push(call);
            Ok(())
        }
    }

    impl ServiceSupervisor for FakeSupervisor {
        fn unit(&self) -> &str {
            "node"
        }
        fn start(&self) -> Result<(), SupervisorError> {
            self.active.set(true);
            self.record("start")
        }
        fn stop(&self) -> Result<(), SupervisorError> {
            self.active.set(false);
            self.record("stop")
        }
        fn restart(&self) -> Result<(), SupervisorError> {
            self.active.set(true);
            self.record("restart")
        }
        fn enable(&self) -> Result<(), SupervisorError> {
            self.record("enable")
        }
        fn reload(&self) -> Result<(), SupervisorError> {
            self.record("reload")
        }
        fn is_active(&self) -> Result<bool, SupervisorError> {
            Ok(self.active.get())
        }
        fn main_pid(&self) -> Result<Option<u32>, SupervisorError> {
            Ok(None)
        }
        fn status_text(&self) -> Result<String, SupervisorError> {
            Ok(String::new())
        }
        fn logs(&self, _lines: usize) -> Result<String, SupervisorError> {
            Ok(String::new())
        }
    }

    /// Fails until the given attempt count is reached
    struct FlakyResolver {
        ready_after: usize,
        calls: Cell<usize>,
    }

    impl Resolver for FlakyResolver {
        fn resolve(&self, host: &str, _port: u16) -> io::Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() > self.ready_after {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, format!("{} not found", host)))
            }
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry.dns_backoff_secs = 0;
        config.retry.package_lock_backoff_secs = 0;
        config.retry.trust_backoff_secs = 0;
        config.health.verify_timeout_secs = 1;
        config.health.verify_poll_secs = 1;
        config
    }

    fn step() -> StepSpec {
        StepSpec::new(0, "test-step", "file:///dev/null")
    }

    fn run(runner: &FakeRunner, supervisor: &FakeSupervisor, config: &Config, actions: Vec<Action>) -> Result<(), StepError> {
        let resolver = FlakyResolver {
            ready_after: 0,
            calls: Cell::new(0),
        };
        let executor = ActionExecutor::new(runner, supervisor, &resolver, config);
        let body = StepBody {
            description: String::new(),
            actions,
            postcondition: None,
        };
        executor.execute(&step(), &body)
    }

    #[test]
    fn test_package_lock_contention_is_retried() {
        let runner = FakeRunner::new(|_, seen| {
            if seen < 2 {
                (100, "E: Could not get lock /var/lib/dpkg/lock-frontend")
            } else {
                (0, "")
            }
        });
        let result = run(
            &runner,
            &FakeSupervisor::default(),
            &fast_config(),
            vec![Action::PackageInstall {
                packages: vec!["git".to_string()],
            }],
        );
        assert!(result.is_ok());
        assert_eq!(runner.count("apt-get install -y git"), 3);
    }

    #[test]
    fn test_package_lock_exhaustion_is_reported() {
        let mut config = fast_config();
        config.retry.package_lock_attempts = 4;
        let runner = FakeRunner::new(|_, _| (100, "E: Could not get lock /var/lib/dpkg/lock"));
        let err = run(
            &runner,
            &FakeSupervisor::default(),
            &config,
            vec![Action::PackageInstall {
                packages: vec!["git".to_string()],
            }],
        )
        .unwrap_err();
        assert!(matches!(err, StepError::RetriesExhausted { attempts: 4, .. }));
    }

    #[test]
    fn test_other_install_failure_is_not_retried() {
        let runner = FakeRunner::new(|_, _| (100, "E: Unable to locate package nope"));
        let err = run(
            &runner,
            &FakeSupervisor::default(),
            &fast_config(),
            vec![Action::PackageInstall {
                packages: vec!["nope".to_string()],
            }],
        )
        .unwrap_err();
        assert!(matches!(err, StepError::CommandFailed { .. }));
        assert_eq!(runner.calls.borrow().len(), 1);
    }

    fn trust_action(companion: bool) -> Action {
        Action::TrustConverge {
            check: CommandSpec::new("pnpm", ["ignored-builds"]),
            grant: CommandSpec::new("pnpm", ["approve-builds"]),
            reinstall: CommandSpec::new("pnpm", ["install"]),
            companion: companion.then(|| CommandSpec::new("sh", ["install-pnpm.sh"])),
            pending_pattern: Some("ignored".to_string()),
        }
    }

    #[test]
    fn test_trust_converges_after_companion() {
        // Initial check plus the first re-check report pending work
        let runner = FakeRunner::new(|line, seen| match line {
            "pnpm ignored-builds" if seen < 2 => (0, "2 ignored builds"),
            _ => (0, ""),
        });
        let result = run(&runner, &FakeSupervisor::default(), &fast_config(), vec![trust_action(true)]);
        assert!(result.is_ok());
        assert_eq!(runner.count("pnpm approve-builds"), 2);
        assert_eq!(runner.count("sh install-pnpm.sh"), 1);
    }

    #[test]
    fn test_trust_gives_up_after_cap() {
        let runner = FakeRunner::new(|line, _| match line {
            "pnpm ignored-builds" => (0, "ignored forever"),
            _ => (0, ""),
        });
        let err = run(&runner, &FakeSupervisor::default(), &fast_config(), vec![trust_action(true)])
            .unwrap_err();
        assert!(matches!(err, StepError::RetriesExhausted { attempts: 3, .. }));
        // Companion runs between attempts only
        assert_eq!(runner.count("sh install-pnpm.sh"), 2);
    }

    #[test]
    fn test_already_converged_trust_is_noop() {
        let runner = FakeRunner::new(|_, _| (0, ""));
        run(&runner, &FakeSupervisor::default(), &fast_config(), vec![trust_action(false)]).unwrap();
        assert_eq!(runner.calls.borrow().as_slice(), ["pnpm ignored-builds".to_string()]);
    }

    #[test]
    fn test_dns_wait_retries_until_resolvable() {
        let config = fast_config();
        let runner = FakeRunner::new(|_, _| (0, ""));
        let supervisor = FakeSupervisor::default();
        let resolver = FlakyResolver {
            ready_after: 3,
            calls: Cell::new(0),
        };
        let executor = ActionExecutor::new(&runner, &supervisor, &resolver, &config);
        executor
            .run_action(&Action::WaitForDns {
                host: "deb.debian.org".to_string(),
                port: 443,
            })
            .unwrap();
        assert_eq!(resolver.calls.get(), 4);
    }

    #[test]
    fn test_git_clone_failure_falls_back_to_archive() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("src");
        let runner = FakeRunner::new(|line, _| {
            if line.starts_with("git clone") {
                (128, "fatal: unable to access repository")
            } else {
                (0, "")
            }
        });
        run(
            &runner,
            &FakeSupervisor::default(),
            &fast_config(),
            vec![Action::GitSync {
                repo: "https://example.com/node.git".to_string(),
                dest: dest.clone(),
                branch: "main".to_string(),
                archive_url: Some("https://example.com/node.tar.gz".to_string()),
                timeout_secs: Some(5),
            }],
        )
        .unwrap();

        let calls = runner.calls.borrow();
        assert!(calls[0].starts_with("git clone --branch main"));
        assert!(calls[1].starts_with("curl -fsSL"));
        assert!(calls[2].starts_with("tar -xzf"));
    }

    #[test]
    fn test_git_existing_checkout_is_reset() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("src");
        fs::create_dir_all(dest.join(".git")).unwrap();
        let runner = FakeRunner::new(|_, _| (0, ""));
        run(
            &runner,
            &FakeSupervisor::default(),
            &fast_config(),
            vec![Action::GitSync {
                repo: "https://example.com/node.git".to_string(),
                dest: dest.clone(),
                branch: "stable".to_string(),
                archive_url: None,
                timeout_secs: None,
            }],
        )
        .unwrap();

        let dir = dest.display().to_string();
        assert_eq!(
            runner.calls.borrow().as_slice(),
            [
                format!("git -C {} fetch origin stable", dir),
                format!("git -C {} reset --hard origin/stable", dir),
            ]
        );
    }

    #[test]
    fn test_write_unit_then_start_service() {
        let temp = TempDir::new().unwrap();
        let mut config = fast_config();
        config.service.exec_start = "/opt/node/bin/node".to_string();
        config.service.unit_path = temp.path().join("node.service");
        let supervisor = FakeSupervisor::default();
        let runner = FakeRunner::new(|_, _| (0, ""));

        run(
            &runner,
            &supervisor,
            &config,
            vec![Action::WriteUnit, Action::StartService { enable: true }],
        )
        .unwrap();

        assert!(config.service.unit_path.exists());
        assert_eq!(supervisor.calls.borrow().as_slice(), ["reload", "enable", "start"]);
    }

    #[test]
    fn test_write_file_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("peers/list.txt");
        write_file(&path, "peer-a\n", Some(0o600)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "peer-a\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_failed_postcondition_fails_step() {
        let config = fast_config();
        let runner = FakeRunner::new(|_, _| (0, ""));
        let supervisor = FakeSupervisor::default();
        let resolver = SystemResolver;
        let executor = ActionExecutor::new(&runner, &supervisor, &resolver, &config);
        let body = StepBody {
            description: "check".to_string(),
            actions: Vec::new(),
            postcondition: Some(Postcondition::PathExists {
                path: PathBuf::from("/definitely/not/here"),
            }),
        };
        assert!(matches!(
            executor.execute(&step(), &body),
            Err(StepError::Postcondition(_))
        ));
    }

    #[test]
    fn test_commands_receive_service_environment() {
        let mut config = fast_config();
        config.service.install_root = PathBuf::from("/opt/node");
        let seen = RefCell::new(HashMap::new());

        struct EnvRunner<'a>(&'a RefCell<HashMap<String, String>>);
        impl CommandRunner for EnvRunner<'_> {
            fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
                self.0.borrow_mut().extend(spec.env.clone());
                Ok(CommandOutput {
                    code: Some(0),
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }

        let runner = EnvRunner(&seen);
        let supervisor = FakeSupervisor::default();
        let executor = ActionExecutor::new(&runner, &supervisor, &SystemResolver, &config);
        executor
            .run_action(&Action::Command(CommandSpec::new("true", Vec::<String>::new())))
            .unwrap();
        assert_eq!(
            seen.borrow().get("INSTALL_ROOT").map(String::as_str),
            Some("/opt/node")
        );
    }
}
