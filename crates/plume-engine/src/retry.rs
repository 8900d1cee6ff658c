use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use plume_contracts::config::RetrySettings;
use tracing::{debug, warn};

use crate::error::{ErrorClass, GenerationError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            multiplier: if settings.multiplier.is_finite() && settings.multiplier >= 1.0 {
                settings.multiplier
            } else {
                1.0
            },
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt `attempt` (1-based): 1s, 2s, 4s, 8s, then
    /// capped at `max_backoff` with the default settings.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *cancelled = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks for up to `duration`. Returns false if cancelled first.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (flag, signal) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = match signal.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        false
    }
}

pub trait Sleeper: Send + Sync {
    /// Returns false when the wait was interrupted by cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CancellableSleeper;

impl Sleeper for CancellableSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        cancel.wait(duration)
    }
}

/// Records requested waits and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits
            .lock()
            .map(|waits| waits.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        self.waits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

/// Runs `op` until it succeeds, `classify` marks its error non-retryable, or
/// the policy runs out of attempts. A non-retryable error comes back wrapped
/// with the attempt it happened on; its class is unchanged.
pub fn with_retry<T>(
    backend: &str,
    classify: impl Fn(&GenerationError) -> ErrorClass,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    mut op: impl FnMut(Attempt) -> Result<T>,
) -> Result<T> {
    let max = policy.max_attempts.max(1);
    for number in 1..=max {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled {
                backend: backend.to_string(),
                attempt: number,
            });
        }

        let err = match op(Attempt { number, max }) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let class = classify(&err);
        if !class.is_retryable() {
            debug!(backend, attempt = number, class = %class, "not retrying");
            return Err(GenerationError::Aborted {
                backend: backend.to_string(),
                attempt: number,
                max,
                source: Box::new(err),
            });
        }
        if number == max {
            return Err(GenerationError::RetriesExhausted {
                backend: backend.to_string(),
                attempts: number,
                source: Box::new(err),
            });
        }

        let delay = policy.backoff_for_attempt(number);
        warn!(
            backend,
            attempt = number,
            max_attempts = max,
            class = %class,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after failure"
        );
        if !sleeper.sleep(delay, cancel) {
            return Err(GenerationError::Cancelled {
                backend: backend.to_string(),
                attempt: number,
            });
        }
    }

    Err(GenerationError::Cancelled {
        backend: backend.to_string(),
        attempt: max,
    })
}
