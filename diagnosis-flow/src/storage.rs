use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::{DiagnosisError, Result},
    models::{Collaborator, CollaboratorResult},
};

/// Externally visible status of a diagnosis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Partial,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Partial => "partial",
            SessionStatus::Failed => "failed",
            SessionStatus::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Step of the coordinator state machine a session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisPhase {
    Created,
    Observing,
    Calculating,
    Completed,
    Partial,
    Timeout,
    Failed,
}

impl DiagnosisPhase {
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            DiagnosisPhase::Created | DiagnosisPhase::Observing | DiagnosisPhase::Calculating => {
                SessionStatus::Active
            }
            DiagnosisPhase::Completed => SessionStatus::Completed,
            DiagnosisPhase::Partial => SessionStatus::Partial,
            DiagnosisPhase::Timeout => SessionStatus::Timeout,
            DiagnosisPhase::Failed => SessionStatus::Failed,
        }
    }

    fn terminal_for(status: SessionStatus) -> Option<DiagnosisPhase> {
        match status {
            SessionStatus::Active => None,
            SessionStatus::Completed => Some(DiagnosisPhase::Completed),
            SessionStatus::Partial => Some(DiagnosisPhase::Partial),
            SessionStatus::Timeout => Some(DiagnosisPhase::Timeout),
            SessionStatus::Failed => Some(DiagnosisPhase::Failed),
        }
    }
}

impl std::fmt::Display for DiagnosisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiagnosisPhase::Created => "created",
            DiagnosisPhase::Observing => "observing",
            DiagnosisPhase::Calculating => "calculating",
            DiagnosisPhase::Completed => "completed",
            DiagnosisPhase::Partial => "partial",
            DiagnosisPhase::Timeout => "timeout",
            DiagnosisPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of one diagnosis, keyed by `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisSession {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub phase: DiagnosisPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only; one entry per collaborator that settled.
    pub results: Vec<CollaboratorResult>,
    pub overall_confidence: Option<f64>,
    pub status_message: Option<String>,
}

impl DiagnosisSession {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            status: SessionStatus::Active,
            phase: DiagnosisPhase::Created,
            created_at: now,
            updated_at: now,
            results: Vec::new(),
            overall_confidence: None,
            status_message: None,
        }
    }

    /// Move the session forward. Phases never regress and terminal phases are final.
    pub fn advance(&mut self, phase: DiagnosisPhase) -> Result<()> {
        if phase == self.phase {
            return Ok(());
        }
        if self.phase.is_terminal() || phase < self.phase {
            return Err(DiagnosisError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.phase.to_string(),
                to: phase.to_string(),
            });
        }
        self.phase = phase;
        self.status = phase.status();
        self.touch();
        Ok(())
    }

    /// Externally requested status change.
    pub fn set_status(&mut self, status: SessionStatus) -> Result<()> {
        if status == self.status {
            return Ok(());
        }
        match DiagnosisPhase::terminal_for(status) {
            Some(phase) if !self.status.is_terminal() => self.advance(phase),
            _ => Err(DiagnosisError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.status.to_string(),
                to: status.to_string(),
            }),
        }
    }

    /// Append a collaborator result. Each collaborator reports at most once.
    pub fn record(&mut self, result: CollaboratorResult) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(DiagnosisError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.phase.to_string(),
                to: format!("record {}", result.collaborator),
            });
        }
        if self.result_for(result.collaborator).is_some() {
            return Err(DiagnosisError::Validation(format!(
                "{} already reported for session {}",
                result.collaborator, self.session_id
            )));
        }
        self.results.push(result);
        self.touch();
        Ok(())
    }

    pub fn result_for(&self, collaborator: Collaborator) -> Option<&CollaboratorResult> {
        self.results.iter().find(|r| r.collaborator == collaborator)
    }

    pub fn progress(&self) -> DiagnosisProgress {
        let completed: Vec<Collaborator> = self
            .results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.collaborator)
            .collect();
        let failed: Vec<Collaborator> = self
            .results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.collaborator)
            .collect();

        let overall_progress = if self.phase.is_terminal() {
            1.0
        } else {
            self.results.len() as f64 / Collaborator::ALL.len() as f64
        };

        DiagnosisProgress {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            phase: self.phase,
            status: self.status,
            completed,
            failed,
            overall_progress,
            status_message: self.status_message.clone(),
            last_updated: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Which collaborators have reported for a session, and how far along it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisProgress {
    pub session_id: String,
    pub user_id: String,
    pub phase: DiagnosisPhase,
    pub status: SessionStatus,
    pub completed: Vec<Collaborator>,
    pub failed: Vec<Collaborator>,
    /// Fraction of collaborators settled, 1.0 once the session is terminal.
    pub overall_progress: f64,
    pub status_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Mutation applied to one session while no other writer can touch it.
pub type SessionMutation = Box<dyn FnOnce(&mut DiagnosisSession) -> Result<()> + Send>;

/// Trait for storing and retrieving diagnosis sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Insert a new session, failing if the id is taken.
    async fn create(&self, session: DiagnosisSession) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<DiagnosisSession>>;
    /// Apply `mutation` atomically and return the updated session.
    async fn update(&self, id: &str, mutation: SessionMutation) -> Result<DiagnosisSession>;
    /// Remove a session, returning whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn len(&self) -> Result<usize>;
}

/// In-memory implementation of SessionStorage.
///
/// Writers to the same session are serialized by the map's per-shard lock;
/// different sessions do not contend beyond shard sharing.
#[derive(Clone, Default)]
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<String, DiagnosisSession>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn create(&self, session: DiagnosisSession) -> Result<()> {
        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(entry) => Err(DiagnosisError::SessionExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<DiagnosisSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn update(&self, id: &str, mutation: SessionMutation) -> Result<DiagnosisSession> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| DiagnosisError::SessionNotFound(id.to_string()))?;

        // Mutate a copy so a failed mutation leaves the stored session untouched.
        let mut updated = entry.clone();
        mutation(&mut updated)?;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.sessions.len())
    }
}
