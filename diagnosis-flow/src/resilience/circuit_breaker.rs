//! Circuit breaker for a single collaborator.
//!
//! # State Transitions
//! ```text
//! Closed   -> Open:     failure_threshold consecutive qualifying failures
//! Open     -> HalfOpen: recovery_timeout elapsed, one probe admitted
//! HalfOpen -> Closed:   success_threshold consecutive probe successes
//! HalfOpen -> Open:     any qualifying probe failure
//! ```
//!
//! While half-open at most one probe is in flight; concurrent callers are rejected
//! with `CircuitOpen` until it settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CollaboratorError, ErrorKind};
use crate::models::Collaborator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Time spent open before a probe is admitted.
    pub recovery_timeout: Duration,
    /// Failure kinds that count against the breaker. Others pass through untouched.
    pub expected_failures: HashSet<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            expected_failures: HashSet::from([
                ErrorKind::Unavailable,
                ErrorKind::Timeout,
                ErrorKind::InvalidResponse,
            ]),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    probe_in_flight: bool,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

/// Point-in-time view of a breaker, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub collaborator: Collaborator,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Remaining time before a probe may be attempted, when open.
    pub retry_after: Option<Duration>,
}

pub struct CircuitBreaker {
    collaborator: Collaborator,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission to run one call. Releases the half-open probe slot if the call is
/// dropped before it settles.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(collaborator: Collaborator, config: CircuitBreakerConfig) -> Self {
        Self {
            collaborator,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                probe_in_flight: false,
                last_failure: None,
                opened_at: None,
            }),
        }
    }

    pub fn collaborator(&self) -> Collaborator {
        self.collaborator
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.lock();
        let retry_after = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(opened_at.elapsed()),
            ),
            _ => None,
        };
        CircuitBreakerStatus {
            collaborator: self.collaborator,
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
            retry_after,
        }
    }

    /// Run `operation` if the breaker admits it.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CollaboratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut admission = self.admit()?;
        let result = operation().await;
        admission.settled = true;

        match &result {
            Ok(_) => self.on_success(admission.probe),
            Err(error) if self.config.expected_failures.contains(&error.kind()) => {
                self.on_failure(error, admission.probe)
            }
            Err(error) => {
                debug!(
                    collaborator = %self.collaborator,
                    kind = %error.kind(),
                    "Failure kind ignored by circuit breaker"
                );
                if admission.probe {
                    self.lock().probe_in_flight = false;
                }
            }
        }
        result
    }

    fn admit(&self) -> Result<Admission<'_>, CollaboratorError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let recovered = inner
                .opened_at
                .is_some_and(|opened_at| opened_at.elapsed() >= self.config.recovery_timeout);
            if !recovered {
                return Err(self.rejected());
            }
            info!(
                collaborator = %self.collaborator,
                "Circuit breaker half-open, admitting probe"
            );
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                probe: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    probe: true,
                    settled: false,
                })
            }
            _ => Err(self.rejected()),
        }
    }

    // Only the probe decides a half-open breaker; stragglers admitted while closed are ignored.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        collaborator = %self.collaborator,
                        successes = inner.success_count,
                        "Circuit breaker closing after successful recovery"
                    );
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &CollaboratorError, probe: bool) {
        let mut inner = self.lock();
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        collaborator = %self.collaborator,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                warn!(
                    collaborator = %self.collaborator,
                    error = %error,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, new_state: CircuitState) {
        inner.state = new_state;
        inner.success_count = 0;
        inner.probe_in_flight = false;
        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
        }
    }

    fn rejected(&self) -> CollaboratorError {
        CollaboratorError::CircuitOpen {
            collaborator: self.collaborator,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
            ..CircuitBreakerConfig::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CollaboratorError> {
        breaker
            .execute(|| async {
                Err(CollaboratorError::unavailable(Collaborator::Listen, "503"))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CollaboratorError> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new(Collaborator::Listen, test_config());
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), _> = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(breaker.status().retry_after.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(Collaborator::Listen, test_config());
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_unexpected_failures_do_not_count() {
        let breaker = CircuitBreaker::new(Collaborator::Listen, test_config());
        for _ in 0..5 {
            let result: Result<(), _> = breaker
                .execute(|| async {
                    Err(CollaboratorError::invalid_input(Collaborator::Listen, "bad audio"))
                })
                .await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breaker = Arc::new(CircuitBreaker::new(Collaborator::Listen, test_config()));
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let invoked = Arc::new(AtomicU32::new(0));

        let probe = {
            let breaker = breaker.clone();
            let invoked = invoked.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        release_rx.await.ok();
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        for _ in 0..5 {
            let invoked = invoked.clone();
            let result: Result<(), _> = breaker
                .execute(|| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        }

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(Collaborator::Listen, test_config());
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            succeed(&breaker).await.unwrap_err().kind(),
            ErrorKind::CircuitOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let breaker = CircuitBreaker::new(Collaborator::Listen, test_config());
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().success_count, 1);
    }
}
