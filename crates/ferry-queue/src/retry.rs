//! Bounded retries with a constant backoff
//!
//! Wraps any fallible async operation. There is no partial-success state: the
//! runner returns the first success, or the error of the final attempt.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max attempts must be a positive integer, got {0}")]
    InvalidMaxAttempts(String),
    #[error("backoff must be a non-negative number of seconds, got {0}")]
    InvalidBackoff(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRunner {
    max_attempts: u32,
    backoff_secs: u64,
}

impl Default for RetryRunner {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_secs: 0,
        }
    }
}

impl RetryRunner {
    pub fn new(max_attempts: u32, backoff_secs: u64) -> Result<Self, RetryConfigError> {
        let mut runner = Self::default();
        runner.set_max_attempts(i64::from(max_attempts))?;
        runner.backoff_secs = backoff_secs;
        Ok(runner)
    }

    /// Build from raw text such as CLI arguments, rejecting non-numeric input
    pub fn parse(max_attempts: &str, backoff_secs: &str) -> Result<Self, RetryConfigError> {
        let attempts: i64 = max_attempts
            .trim()
            .parse()
            .map_err(|_| RetryConfigError::InvalidMaxAttempts(max_attempts.to_string()))?;
        let backoff: i64 = backoff_secs
            .trim()
            .parse()
            .map_err(|_| RetryConfigError::InvalidBackoff(backoff_secs.to_string()))?;

        let mut runner = Self::default();
        runner.set_max_attempts(attempts)?;
        runner.set_backoff(backoff)?;
        Ok(runner)
    }

    pub fn set_max_attempts(&mut self, max_attempts: i64) -> Result<(), RetryConfigError> {
        self.max_attempts = u32::try_from(max_attempts)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| RetryConfigError::InvalidMaxAttempts(max_attempts.to_string()))?;
        Ok(())
    }

    pub fn set_backoff(&mut self, backoff_secs: i64) -> Result<(), RetryConfigError> {
        self.backoff_secs = u64::try_from(backoff_secs)
            .map_err(|_| RetryConfigError::InvalidBackoff(backoff_secs.to_string()))?;
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    /// Invoke `op` until it succeeds or the attempts run out
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    debug!(attempt, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempt, error = %e, "Operation failed, no attempts left");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_secs = self.backoff_secs,
                        error = %e,
                        "Operation failed, retrying after backoff"
                    );
                    if self.backoff_secs > 0 {
                        tokio::time::sleep(self.backoff()).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
