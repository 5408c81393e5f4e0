//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::{
    clients::DiagnosticService,
    error::{CollaboratorError, ErrorKind},
    models::Collaborator,
};

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { confidence: f64, findings: Vec<String> },
    Fail(ErrorKind),
    /// Sleep, then succeed with confidence 0.5.
    Sleep(Duration),
    /// Fail with `Unavailable` the first `n` calls, then succeed with confidence 0.5.
    FailTimes(u32),
    /// Reply without a confidence field.
    Malformed,
}

pub struct MockService {
    collaborator: Collaborator,
    behavior: Behavior,
    calls: AtomicU32,
    healthy: bool,
    last_input: std::sync::Mutex<Option<Value>>,
}

impl MockService {
    pub fn new(collaborator: Collaborator, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            collaborator,
            behavior,
            calls: AtomicU32::new(0),
            healthy: true,
            last_input: std::sync::Mutex::new(None),
        })
    }

    pub fn succeeding(collaborator: Collaborator, confidence: f64, findings: &[&str]) -> Arc<Self> {
        Self::new(
            collaborator,
            Behavior::Succeed {
                confidence,
                findings: findings.iter().map(|f| f.to_string()).collect(),
            },
        )
    }

    pub fn unhealthy(collaborator: Collaborator) -> Arc<Self> {
        Arc::new(Self {
            collaborator,
            behavior: Behavior::Fail(ErrorKind::Unavailable),
            calls: AtomicU32::new(0),
            healthy: false,
            last_input: std::sync::Mutex::new(None),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<Value> {
        self.last_input.lock().unwrap().clone()
    }

    fn error(&self, kind: ErrorKind) -> CollaboratorError {
        let collaborator = self.collaborator;
        match kind {
            ErrorKind::Unavailable => CollaboratorError::unavailable(collaborator, "mock unavailable"),
            ErrorKind::Timeout => CollaboratorError::Timeout {
                collaborator,
                timeout_ms: 0,
            },
            ErrorKind::CircuitOpen => CollaboratorError::CircuitOpen { collaborator },
            ErrorKind::InvalidResponse => {
                CollaboratorError::invalid_response(collaborator, "mock invalid response")
            }
            ErrorKind::InvalidInput => {
                CollaboratorError::invalid_input(collaborator, "mock invalid input")
            }
        }
    }
}

#[async_trait]
impl DiagnosticService for MockService {
    fn collaborator(&self) -> Collaborator {
        self.collaborator
    }

    async fn call(&self, input: Value) -> Result<Value, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_input.lock().unwrap() = Some(input);

        match &self.behavior {
            Behavior::Succeed {
                confidence,
                findings,
            } => Ok(json!({ "confidence": confidence, "findings": findings })),
            Behavior::Fail(kind) => Err(self.error(*kind)),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(json!({ "confidence": 0.5 }))
            }
            Behavior::FailTimes(n) if call <= *n => Err(self.error(ErrorKind::Unavailable)),
            Behavior::FailTimes(_) => Ok(json!({ "confidence": 0.5 })),
            Behavior::Malformed => Ok(json!({ "result": "no confidence here" })),
        }
    }

    async fn health(&self) -> Result<(), CollaboratorError> {
        if self.healthy {
            Ok(())
        } else {
            Err(self.error(ErrorKind::Unavailable))
        }
    }
}
