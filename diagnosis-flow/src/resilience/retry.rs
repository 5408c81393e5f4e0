//! Retry with configurable backoff.
//!
//! Delay before attempt `n + 1` is derived from the attempt `n` that just failed:
//! - fixed: `base_delay`
//! - linear: `base_delay * n`
//! - exponential: `base_delay * backoff_multiplier^(n - 1)`
//! - random: uniform in `[base_delay, max_delay]`
//!
//! The result is clamped to `max_delay`, optionally perturbed by ±10% jitter and
//! floored at zero.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CollaboratorError, ErrorKind};
use crate::models::Collaborator;

const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Failure kinds that may be retried.
    pub retry_on: HashSet<ErrorKind>,
    /// Failure kinds that end the call immediately, even on the first attempt.
    pub stop_on: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on: HashSet::from([ErrorKind::Unavailable, ErrorKind::Timeout]),
            stop_on: HashSet::from([ErrorKind::CircuitOpen, ErrorKind::InvalidInput]),
        }
    }
}

/// Re-invokes an operation on transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    collaborator: Collaborator,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(collaborator: Collaborator, config: RetryConfig) -> Self {
        Self {
            collaborator,
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failure on `attempt` (1-based) should be followed by another attempt.
    pub fn should_retry(&self, error: &CollaboratorError, attempt: u32) -> bool {
        let kind = error.kind();
        if self.config.stop_on.contains(&kind) {
            return false;
        }
        if attempt >= self.config.max_attempts {
            return false;
        }
        self.config.retry_on.contains(&kind)
    }

    /// Backoff before clamping and jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let attempt = attempt.max(1);
        let secs = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
                base * self.config.backoff_multiplier.powi(exponent)
            }
            BackoffStrategy::Random => {
                let max = self.config.max_delay.as_secs_f64();
                if max <= base {
                    base
                } else {
                    rand::rng().random_range(base..=max)
                }
            }
        };
        duration_from_secs(secs)
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut secs = self
            .raw_delay(attempt)
            .min(self.config.max_delay)
            .as_secs_f64();
        if self.config.jitter {
            let factor = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
            secs += secs * factor;
        }
        duration_from_secs(secs)
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            collaborator = %self.collaborator,
                            attempt,
                            "Collaborator call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        if attempt > 1 {
                            warn!(
                                collaborator = %self.collaborator,
                                attempts = attempt,
                                error = %error,
                                "Giving up on collaborator call"
                            );
                        }
                        return Err(error);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        collaborator = %self.collaborator,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying collaborator call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Saturates instead of panicking: huge or infinite values become `Duration::MAX`.
fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
