use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use super::retry::{RetryConfig, RetryPolicy};
use super::timeout::TimeoutGuard;
use crate::error::CollaboratorError;
use crate::models::Collaborator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upper bound for a single attempt.
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl ResilienceConfig {
    /// Observation services get more attempts and a more tolerant breaker.
    pub fn observation() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                ..CircuitBreakerConfig::default()
            },
            call_timeout: Duration::from_secs(10),
        }
    }

    /// The calculation service consumes the combined observation output, so it
    /// fails fast instead of stacking retries on top of the observation phase.
    pub fn calculation() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 2,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                ..CircuitBreakerConfig::default()
            },
            call_timeout: Duration::from_secs(15),
        }
    }

    pub fn for_collaborator(collaborator: Collaborator) -> Self {
        if collaborator.is_observation() {
            Self::observation()
        } else {
            Self::calculation()
        }
    }
}

/// Observability snapshot of a [`ResiliencePolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceStatus {
    pub collaborator: Collaborator,
    pub circuit_breaker: CircuitBreakerStatus,
    pub retry: RetryConfig,
    pub call_timeout: Duration,
}

/// Retry (outermost) around circuit breaker around timeout (innermost).
///
/// Every attempt is breaker-guarded and every breaker-guarded attempt is
/// time-bounded, so timeouts count as breaker failures and an open breaker
/// stops further retries.
pub struct ResiliencePolicy {
    collaborator: Collaborator,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    timeout: TimeoutGuard,
}

impl ResiliencePolicy {
    pub fn new(collaborator: Collaborator, config: ResilienceConfig) -> Self {
        Self {
            collaborator,
            retry: RetryPolicy::new(collaborator, config.retry),
            breaker: CircuitBreaker::new(collaborator, config.circuit_breaker),
            timeout: TimeoutGuard::new(collaborator, config.call_timeout),
        }
    }

    pub fn collaborator(&self) -> Collaborator {
        self.collaborator
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` under the policy. `operation` is only invoked once the breaker
    /// has admitted the attempt.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        // Each attempt borrows the operation only while building its future.
        let operation = Mutex::new(operation);
        let operation = &operation;
        let breaker = &self.breaker;
        let timeout = &self.timeout;
        self.retry
            .execute(move || {
                breaker.execute(move || {
                    let call = (operation.lock().unwrap_or_else(PoisonError::into_inner))();
                    timeout.execute(call)
                })
            })
            .await
    }

    pub fn status(&self) -> ResilienceStatus {
        ResilienceStatus {
            collaborator: self.collaborator,
            circuit_breaker: self.breaker.status(),
            retry: self.retry.config().clone(),
            call_timeout: self.timeout.timeout(),
        }
    }
}
