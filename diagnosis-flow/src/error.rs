use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Collaborator;

/// Discriminant of a [`CollaboratorError`], used by retry and circuit breaker
/// configuration to classify failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    Timeout,
    CircuitOpen,
    InvalidResponse,
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::InvalidInput => "invalid_input",
        };
        f.write_str(name)
    }
}

/// Failure of a single call to a diagnostic collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollaboratorError {
    /// Transient failure: the collaborator could not be reached or answered with a server error.
    #[error("{collaborator} service unavailable: {reason}")]
    Unavailable {
        collaborator: Collaborator,
        reason: String,
    },

    #[error("{collaborator} service timed out after {timeout_ms}ms")]
    Timeout {
        collaborator: Collaborator,
        timeout_ms: u64,
    },

    /// The breaker for this collaborator rejected the call without invoking it.
    #[error("circuit breaker open for {collaborator} service")]
    CircuitOpen { collaborator: Collaborator },

    #[error("{collaborator} service returned an invalid response: {reason}")]
    InvalidResponse {
        collaborator: Collaborator,
        reason: String,
    },

    /// The collaborator refused the input it was given. Retrying cannot help.
    #[error("{collaborator} service rejected its input: {reason}")]
    InvalidInput {
        collaborator: Collaborator,
        reason: String,
    },
}

impl CollaboratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollaboratorError::Unavailable { .. } => ErrorKind::Unavailable,
            CollaboratorError::Timeout { .. } => ErrorKind::Timeout,
            CollaboratorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CollaboratorError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            CollaboratorError::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }

    pub fn collaborator(&self) -> Collaborator {
        match self {
            CollaboratorError::Unavailable { collaborator, .. }
            | CollaboratorError::Timeout { collaborator, .. }
            | CollaboratorError::CircuitOpen { collaborator }
            | CollaboratorError::InvalidResponse { collaborator, .. }
            | CollaboratorError::InvalidInput { collaborator, .. } => *collaborator,
        }
    }

    pub fn unavailable(collaborator: Collaborator, reason: impl Into<String>) -> Self {
        CollaboratorError::Unavailable {
            collaborator,
            reason: reason.into(),
        }
    }

    pub fn invalid_response(collaborator: Collaborator, reason: impl Into<String>) -> Self {
        CollaboratorError::InvalidResponse {
            collaborator,
            reason: reason.into(),
        }
    }

    pub fn invalid_input(collaborator: Collaborator, reason: impl Into<String>) -> Self {
        CollaboratorError::InvalidInput {
            collaborator,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the diagnosis orchestration core.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Invalid session transition for {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DiagnosisError>;
