use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    aggregation::RankedFinding,
    error::{CollaboratorError, DiagnosisError, ErrorKind, Result},
    storage::SessionStatus,
};

/// One of the five independently deployed diagnostic services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    Inquiry,
    Look,
    Listen,
    Palpation,
    Calculation,
}

impl Collaborator {
    pub const ALL: [Collaborator; 5] = [
        Collaborator::Inquiry,
        Collaborator::Look,
        Collaborator::Listen,
        Collaborator::Palpation,
        Collaborator::Calculation,
    ];

    /// Collaborators whose outputs feed the calculation step.
    pub const OBSERVATION: [Collaborator; 4] = [
        Collaborator::Inquiry,
        Collaborator::Look,
        Collaborator::Listen,
        Collaborator::Palpation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::Inquiry => "inquiry",
            Collaborator::Look => "look",
            Collaborator::Listen => "listen",
            Collaborator::Palpation => "palpation",
            Collaborator::Calculation => "calculation",
        }
    }

    pub fn is_observation(&self) -> bool {
        !matches!(self, Collaborator::Calculation)
    }
}

impl std::fmt::Display for Collaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientProfile {
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
}

/// Input to a diagnosis. Immutable once accepted by the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub user_id: String,
    /// Assigned by the coordinator when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub profile: PatientProfile,
    #[serde(default)]
    pub chief_complaint: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub medical_history: Vec<String>,
    #[serde(default)]
    pub current_medications: Vec<String>,
    #[serde(default)]
    pub lifestyle: BTreeMap<String, Value>,
    /// Opaque reference to face/tongue imagery, forwarded to the look service.
    #[serde(default)]
    pub look_data: Option<Value>,
    /// Opaque reference to voice/breathing audio, forwarded to the listen service.
    #[serde(default)]
    pub listen_data: Option<Value>,
    /// Opaque reference to pulse signals, forwarded to the palpation service.
    #[serde(default)]
    pub palpation_data: Option<Value>,
}

impl DiagnosisRequest {
    pub fn new(user_id: impl Into<String>, symptoms: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            symptoms,
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Rejects requests without a user or without any non-blank symptom.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(DiagnosisError::Validation(
                "user_id must not be empty".to_string(),
            ));
        }
        if self.symptoms.iter().all(|s| s.trim().is_empty()) {
            return Err(DiagnosisError::Validation(
                "symptoms must contain at least one entry".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a collaborator produced no usable result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CollaboratorError> for FailureDescriptor {
    fn from(error: &CollaboratorError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one collaborator call within one session. Never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorResult {
    pub collaborator: Collaborator,
    pub payload: Value,
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<String>,
    pub error: Option<FailureDescriptor>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl CollaboratorResult {
    pub fn success(
        collaborator: Collaborator,
        payload: Value,
        confidence: f64,
        findings: Vec<String>,
    ) -> Self {
        Self {
            collaborator,
            payload,
            confidence,
            findings,
            error: None,
            processing_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(collaborator: Collaborator, error: &CollaboratorError) -> Self {
        Self {
            collaborator,
            payload: Value::Null,
            confidence: 0.0,
            findings: Vec::new(),
            error: Some(error.into()),
            processing_time_ms: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn with_processing_time(mut self, elapsed: std::time::Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Terminal report of one `coordinate_diagnosis` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    /// `None` when no collaborator produced a usable result.
    pub overall_confidence: Option<f64>,
    pub data_quality_score: f64,
    pub primary_findings: Vec<RankedFinding>,
    pub collaborator_results: Vec<CollaboratorResult>,
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

impl DiagnosisResult {
    pub fn result_for(&self, collaborator: Collaborator) -> Option<&CollaboratorResult> {
        self.collaborator_results
            .iter()
            .find(|r| r.collaborator == collaborator)
    }
}
