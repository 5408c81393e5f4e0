use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::CollaboratorError;
use crate::models::Collaborator;

/// Bounds how long a single collaborator call may run.
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    collaborator: Collaborator,
    timeout: Duration,
}

impl TimeoutGuard {
    pub fn new(collaborator: Collaborator, timeout: Duration) -> Self {
        Self {
            collaborator,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` within the configured timeout, failing with `Timeout` on overrun.
    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, CollaboratorError>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        self.execute_within(operation, self.timeout).await
    }

    pub async fn execute_within<T, Fut>(
        &self,
        operation: Fut,
        timeout: Duration,
    ) -> Result<T, CollaboratorError>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    collaborator = %self.collaborator,
                    timeout_ms = timeout.as_millis() as u64,
                    "Collaborator call timed out"
                );
                Err(CollaboratorError::Timeout {
                    collaborator: self.collaborator,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Like [`execute`](Self::execute) but reports an overrun as `Ok(None)`.
    pub async fn execute_or_none<T, Fut>(&self, operation: Fut) -> Result<Option<T>, CollaboratorError>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
