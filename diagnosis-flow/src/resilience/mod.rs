//! Composable resilience primitives wrapped around every collaborator call.

pub mod circuit_breaker;
pub mod policy;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use policy::{ResilienceConfig, ResiliencePolicy, ResilienceStatus};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
pub use timeout::TimeoutGuard;
