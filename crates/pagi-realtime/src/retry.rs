//! Bounded retry with a fixed escalating backoff schedule.
//!
//! The policy is the single place that decides retry-vs-abort. Fatal errors
//! propagate immediately, transient ones wait `schedule(attempt)` and try again,
//! and a cancelled token turns any wait (or in-flight attempt) into
//! `RealtimeError::Cancelled`.

use crate::error::{ErrorClass, RealtimeError, RealtimeResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff delays used when no schedule is supplied.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Delay before retry number `attempt` (1-based index of the failed attempt).
pub type DelaySchedule = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Error classifier used to pick between retry and abort.
pub type Classifier = fn(&RealtimeError) -> ErrorClass;

/// Build a schedule from a fixed list of delays. Attempts past the end reuse the last delay.
pub fn fixed_schedule(delays: &[Duration]) -> DelaySchedule {
    let delays: Vec<Duration> = if delays.is_empty() {
        DEFAULT_BACKOFF.to_vec()
    } else {
        delays.to_vec()
    };
    Arc::new(move |attempt| {
        let idx = (attempt.max(1) as usize - 1).min(delays.len() - 1);
        delays[idx]
    })
}

/// Passed to the observer before every backoff wait.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a RealtimeError,
}

/// Bounded-retry executor.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    schedule: DelaySchedule,
    classify: Classifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// Policy with the default 500ms / 1s / 2s schedule.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            schedule: fixed_schedule(&DEFAULT_BACKOFF),
            classify: RealtimeError::class,
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1)
    }

    pub fn with_schedule(mut self, schedule: DelaySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.schedule)(attempt)
    }

    /// Run `op` until it succeeds, a fatal error occurs, attempts run out, or
    /// `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> RealtimeResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RealtimeResult<T>>,
    {
        self.run_observed(cancel, |_| {}, op).await
    }

    /// Like [`run`](Self::run), calling `observer` before each backoff wait.
    pub async fn run_observed<T, F, Fut, O>(
        &self,
        cancel: &CancellationToken,
        mut observer: O,
        mut op: F,
    ) -> RealtimeResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RealtimeResult<T>>,
        O: FnMut(RetryAttempt<'_>),
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RealtimeError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RealtimeError::Cancelled),
                r = op(attempt) => r,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match (self.classify)(&err) {
                ErrorClass::Cancelled => return Err(RealtimeError::Cancelled),
                ErrorClass::Fatal => {
                    warn!("⛔ Attempt {}/{} failed fatally: {}", attempt, self.max_attempts, err);
                    return Err(err);
                }
                ErrorClass::Transient if attempt >= self.max_attempts => {
                    warn!("⛔ Giving up after {} attempts: {}", attempt, err);
                    return Err(err);
                }
                ErrorClass::Transient => {}
            }

            let delay = self.delay_for(attempt);
            warn!(
                "🔁 Attempt {}/{} failed ({}), retrying in {:?}",
                attempt, self.max_attempts, err, delay
            );
            observer(RetryAttempt {
                attempt,
                max_attempts: self.max_attempts,
                delay,
                error: &err,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Backoff wait cancelled");
                    return Err(RealtimeError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
