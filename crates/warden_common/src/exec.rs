//! Bounded external command execution
//!
//! Every external call (package manager, git, supervisor, installers) goes
//! through here so nothing can hang a provisioning run or a health check.
//! The child runs in its own process group and is polled until it exits or
//! its deadline passes, then the whole group is killed.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest wait for output pipes once the command itself has exited
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// A command to run, as written in step bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides the runner's default timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last few lines of stderr (or stdout) for error messages
    pub fn summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = text.trim().lines().collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} timed out after {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("{command} not run: provisioning is shutting down")]
    Cancelled { command: String },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::TimedOut { .. })
    }
}

/// Runs commands; a trait so step actions can be exercised without a host
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Process groups of commands that are currently running
///
/// Every command is spawned as the leader of its own process group, so
/// terminating the group also reaches anything it forked. A signal handler
/// uses this to stop the in-flight step before the run lock is released.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    inner: Arc<Mutex<GroupState>>,
}

#[derive(Debug, Default)]
struct GroupState {
    live: HashSet<i32>,
    /// Set by `terminate`; no new command may start afterwards
    closed: bool,
}

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pgid`; false once the set has been terminated
    fn insert(&self, pgid: i32) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return true;
        };
        if state.closed {
            return false;
        }
        state.live.insert(pgid);
        true
    }

    fn remove(&self, pgid: i32) {
        if let Ok(mut state) = self.inner.lock() {
            state.live.remove(&pgid);
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .map(|state| state.live.is_empty())
            .unwrap_or(true)
    }

    /// Refuse new commands, SIGTERM every tracked group, then SIGKILL
    /// whatever outlives `grace`
    ///
    /// Returns the number of groups that were signalled.
    pub fn terminate(&self, grace: Duration) -> usize {
        let groups: Vec<i32> = match self.inner.lock() {
            Ok(mut state) => {
                state.closed = true;
                state.live.iter().copied().collect()
            }
            Err(_) => Vec::new(),
        };
        for &pgid in &groups {
            info!(pgid, "terminating command process group");
            signal_group(pgid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        loop {
            let alive: Vec<i32> = groups.iter().copied().filter(|&g| group_alive(g)).collect();
            if alive.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for pgid in alive {
                    warn!(pgid, "process group ignored SIGTERM, killing");
                    signal_group(pgid, Signal::SIGKILL);
                }
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        groups.len()
    }
}

fn signal_group(pgid: i32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
        if e != Errno::ESRCH {
            warn!(pgid, error = %e, "failed to signal process group");
        }
    }
}

fn group_alive(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None::<Signal>), Err(Errno::ESRCH))
}

/// Runs real processes with a default deadline
#[derive(Debug, Clone)]
pub struct SystemRunner {
    pub default_timeout: Duration,
    groups: Option<ProcessGroups>,
}

impl SystemRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            groups: None,
        }
    }

    /// Register running commands with `groups`
    pub fn with_groups(mut self, groups: ProcessGroups) -> Self {
        self.groups = Some(groups);
        self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        run_tracked(spec, timeout, self.groups.as_ref())
    }
}

/// Spawn `spec` and wait at most `timeout` for it
pub fn run_with_timeout(spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ExecError> {
    run_tracked(spec, timeout, None)
}

fn run_tracked(
    spec: &CommandSpec,
    timeout: Duration,
    groups: Option<&ProcessGroups>,
) -> Result<CommandOutput, ExecError> {
    debug!(command = %spec, timeout_secs = timeout.as_secs(), "running command");

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let deadline = Instant::now() + timeout;
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pgid = child.id() as i32;
    if let Some(groups) = groups {
        if !groups.insert(pgid) {
            kill(&mut child, pgid);
            return Err(ExecError::Cancelled {
                command: spec.to_string(),
            });
        }
    }

    // Drain pipes concurrently so a chatty child cannot block on a full pipe
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = wait_until(&mut child, pgid, deadline);
    if let Some(groups) = groups {
        groups.remove(pgid);
    }
    let status = match waited {
        Ok(status) => status,
        Err(WaitFailure::TimedOut) => {
            warn!(command = %spec, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(ExecError::TimedOut {
                command: spec.to_string(),
                timeout,
            });
        }
        Err(WaitFailure::Io(source)) => {
            return Err(ExecError::Wait {
                program: spec.program.clone(),
                source,
            });
        }
    };

    // Background descendants may still hold the pipes open; they get what is
    // left of the deadline, capped, and then the captured output is returned
    let drain_deadline = deadline.min(Instant::now() + PIPE_GRACE);
    let (stdout, stdout_complete) = stdout.finish(drain_deadline);
    let (stderr, stderr_complete) = stderr.finish(drain_deadline);
    if !(stdout_complete && stderr_complete) {
        warn!(command = %spec, "output pipes still held by a background process, not waiting");
    }

    Ok(CommandOutput {
        code: status.code(),
        success: status.success(),
        stdout,
        stderr,
    })
}

enum WaitFailure {
    TimedOut,
    Io(io::Error),
}

fn wait_until(child: &mut Child, pgid: i32, deadline: Instant) -> Result<ExitStatus, WaitFailure> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                kill(child, pgid);
                return Err(WaitFailure::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill(child, pgid);
                return Err(WaitFailure::Io(source));
            }
        }
    }
}

/// Output captured so far plus a signal for end of stream
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl Drain {
    /// Wait for end of stream until `deadline`; returns the text and whether
    /// the stream was read to the end
    fn finish(self, deadline: Instant) -> (String, bool) {
        let complete = self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_ok();
        let text = self
            .buf
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();
        (text, complete)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&buf);
    thread::spawn(move || {
        if let Some(mut pipe) = pipe {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send(());
    });
    Drain { buf, done }
}

fn kill(child: &mut Child, pgid: i32) {
    signal_group(pgid, Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}
