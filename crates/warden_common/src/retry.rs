//! Bounded retry with backoff
//!
//! One primitive for every transient concern during provisioning: waiting for
//! name resolution, waiting out a package-manager lock, converging dependency
//! trust. Call sites differ only in attempt cap, backoff, which errors count
//! as transient, and an optional hook run between attempts.

use std::time::Duration;
use tracing::debug;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `attempt * base`
    Linear(Duration),
}

impl Backoff {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(base) => base.saturating_mul(attempt),
        }
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final success value, or the error from the last attempt
    pub result: Result<T, E>,
    /// Number of attempts actually made
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// `max_attempts` below 1 is treated as 1
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Retry every failure up to the attempt cap
    pub fn run<T, E, F>(&self, op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.execute(op, |_| true, |_, _| {})
    }

    /// Retry every failure, running `hook` between attempts
    ///
    /// The hook sees the attempt number that just failed and its error. It is
    /// not called after the final attempt.
    pub fn run_with_hook<T, E, F, H>(&self, op: F, hook: H) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        H: FnMut(u32, &E),
    {
        self.execute(op, |_| true, hook)
    }

    /// Retry only failures that `is_transient` accepts; others end the loop
    pub fn run_if<T, E, F, P>(&self, op: F, is_transient: P) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        self.execute(op, is_transient, |_, _| {})
    }

    fn execute<T, E, F, P, H>(&self, mut op: F, is_transient: P, mut hook: H) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        H: FnMut(u32, &E),
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !is_transient(&err) {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                    hook(attempt, &err);
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, max = self.max_attempts, ?delay, "retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
