//! Retry-until-success with a cooperative exit.
//!
//! Every call site that used to spin on a failing request goes through
//! [`retry_until`]. Failed attempts are classified by [`Retryable`]: a
//! retryable failure sleeps for the policy delay and tries again, a fatal
//! one is returned immediately. Between attempts the caller's stop
//! predicate is consulted, so a loop against a target that never comes up
//! can still be ended by "test finished" or an operator abort.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Classifies an error as worth retrying or not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(100))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),

    #[error("stopped before the call succeeded")]
    Stopped,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn is_stopped(&self) -> bool {
        matches!(self, RetryError::Stopped)
    }

    /// Convert the inner error type.
    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> RetryError<F> {
        match self {
            RetryError::Fatal(e) => RetryError::Fatal(f(e)),
            RetryError::Stopped => RetryError::Stopped,
            RetryError::Exhausted { attempts, last } => RetryError::Exhausted {
                attempts,
                last: f(last),
            },
        }
    }
}

/// Run `op` until it succeeds, fails fatally, runs out of attempts, or
/// `should_stop` returns true after a failed attempt.
pub async fn retry_until<T, E, Op, Stop>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_stop: Stop,
) -> Result<T, RetryError<E>>
where
    Op: AsyncFnMut() -> Result<T, E>,
    Stop: AsyncFnMut() -> bool,
    E: Retryable + Display,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) => e,
        };

        if let Some(max) = policy.max_attempts
            && attempts >= max
        {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        debug!(attempt = attempts, error = %err, "call failed, retrying");
        tokio::time::sleep(policy.delay).await;

        if should_stop().await {
            debug!(attempts, "retry loop stopped by caller");
            return Err(RetryError::Stopped);
        }
    }
}

/// Cooperative stop flag checked at iteration boundaries.
///
/// Backed by a `watch` channel so that waiting code can also wake up
/// early when the flag is raised.
#[derive(Debug, Clone)]
pub struct StopFlag {
    rx: watch::Receiver<bool>,
}

impl StopFlag {
    /// Create a flag together with the sender used to raise it.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A flag that is never raised.
    pub fn never() -> Self {
        let (_tx, flag) = Self::new();
        flag
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`, returning early if the flag is raised.
    /// Returns true when the flag is set.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = rx.changed() => {
                // A dropped sender can never raise the flag; finish the nap.
                if changed.is_err() {
                    tokio::time::sleep(duration).await;
                }
            }
        }
        self.is_set()
    }
}
