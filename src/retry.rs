//! Bounded retry of transient failures with a fixed delay.
//!
//! Transient errors map to `backoff::Error::transient`, everything else to
//! `backoff::Error::permanent`, so fatal errors stop the loop on the first
//! attempt. The attempt budget is enforced by [`FixedAttempts`].

use crate::audit::{AuditLog, AuditTag};
use crate::error::DbError;
use backoff::backoff::Backoff;
use futures::TryFutureExt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Constant delay between attempts, giving up after `max_attempts` in total.
#[derive(Debug, Clone)]
pub struct FixedAttempts {
    delay: Duration,
    max_attempts: u32,
    retries_left: u32,
}

impl FixedAttempts {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            delay,
            max_attempts,
            retries_left: max_attempts - 1,
        }
    }
}

impl Backoff for FixedAttempts {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        Some(self.delay)
    }

    fn reset(&mut self) {
        self.retries_left = self.max_attempts - 1;
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    audit: AuditLog,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; values below one are treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            audit: AuditLog::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds, fails fatally, or the attempts run out.
    ///
    /// `op` is called once per attempt and must build fresh state each time.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 0u32;
        let result = backoff::future::retry_notify(
            FixedAttempts::new(self.max_attempts, self.delay),
            || op().map_err(classify),
            |err: DbError, delay: Duration| {
                attempt += 1;
                self.on_retry(operation, attempt, &err, delay);
            },
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            // Only transient errors are ever retried, so one escaping the loop
            // means the budget is spent.
            Err(last) if last.is_transient() => Err(self.exhausted(operation, last)),
            Err(fatal) => Err(self.fatal(operation, fatal)),
        }
    }

    /// Blocking counterpart of [`RetryPolicy::run`]; sleeps the current thread
    /// between attempts.
    pub fn run_blocking<T, F>(&self, operation: &str, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Result<T, DbError>,
    {
        let mut attempt = 0u32;
        let result = backoff::retry_notify(
            FixedAttempts::new(self.max_attempts, self.delay),
            || op().map_err(classify),
            |err: DbError, delay: Duration| {
                attempt += 1;
                self.on_retry(operation, attempt, &err, delay);
            },
        );

        match result {
            Ok(value) => Ok(value),
            Err(backoff::Error::Transient { err, .. }) => Err(self.exhausted(operation, err)),
            Err(backoff::Error::Permanent(err)) => Err(self.fatal(operation, err)),
        }
    }

    fn on_retry(&self, operation: &str, attempt: u32, err: &DbError, delay: Duration) {
        warn!(
            operation,
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        self.audit.record(
            AuditTag::Retry,
            operation,
            Some(format!("{}. Retry {}/{}", err, attempt, self.max_attempts)),
        );
    }

    fn exhausted(&self, operation: &str, last: DbError) -> DbError {
        let err = DbError::RetriesExhausted {
            attempts: self.max_attempts,
            last: Box::new(last),
        };
        error!(operation, error = %err, "Retries exhausted");
        self.audit
            .record(AuditTag::Exhausted, operation, Some(err.to_string()));
        err
    }

    fn fatal(&self, operation: &str, err: DbError) -> DbError {
        warn!(operation, error = %err, "Non-retryable failure, aborting retries");
        err
    }
}

fn classify(err: DbError) -> backoff::Error<DbError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}
