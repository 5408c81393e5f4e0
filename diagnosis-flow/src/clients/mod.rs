//! Typed callers for the five diagnostic collaborators.
//!
//! A [`DiagnosticService`] is the raw transport to one collaborator. Each typed
//! client pairs a service with its own [`ResiliencePolicy`] and turns the reply
//! into a [`CollaboratorResult`].

pub mod calculation;
#[cfg(feature = "http")]
pub mod http;
pub mod inquiry;
pub mod listen;
pub mod look;
pub mod palpation;

pub use calculation::CalculationClient;
#[cfg(feature = "http")]
pub use http::HttpDiagnosticService;
pub use inquiry::InquiryClient;
pub use listen::ListenClient;
pub use look::LookClient;
pub use palpation::PalpationClient;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::Instant;

use crate::{
    error::CollaboratorError,
    models::{Collaborator, CollaboratorResult, DiagnosisRequest},
    resilience::{ResilienceConfig, ResiliencePolicy, ResilienceStatus},
};

/// Transport to one remote diagnostic service.
///
/// Implementations must fail fast and keep "unavailable" distinguishable from
/// "invalid input" so the resilience policy can classify failures.
#[async_trait]
pub trait DiagnosticService: Send + Sync {
    fn collaborator(&self) -> Collaborator;

    /// Send one structured request and return the structured reply.
    async fn call(&self, input: Value) -> Result<Value, CollaboratorError>;

    /// Liveness probe, independent of any diagnosis.
    async fn health(&self) -> Result<(), CollaboratorError>;
}

/// A diagnostic service bound to its resilience policy.
pub struct DiagnosticClient {
    service: Arc<dyn DiagnosticService>,
    policy: ResiliencePolicy,
}

impl DiagnosticClient {
    pub fn new(service: Arc<dyn DiagnosticService>, config: ResilienceConfig) -> Self {
        let policy = ResiliencePolicy::new(service.collaborator(), config);
        Self { service, policy }
    }

    pub fn collaborator(&self) -> Collaborator {
        self.service.collaborator()
    }

    pub fn service(&self) -> &Arc<dyn DiagnosticService> {
        &self.service
    }

    pub fn status(&self) -> ResilienceStatus {
        self.policy.status()
    }

    /// Call the service under its resilience policy and parse the reply.
    pub async fn invoke(&self, input: Value) -> Result<CollaboratorResult, CollaboratorError> {
        let collaborator = self.collaborator();
        let started = Instant::now();
        let result = self
            .policy
            .execute(|| {
                let service = self.service.clone();
                let input = input.clone();
                async move {
                    let reply = service.call(input).await?;
                    parse_reply(collaborator, reply)
                }
            })
            .await?;

        Ok(result.with_processing_time(started.elapsed()))
    }
}

/// Extract `confidence` and `findings` from a collaborator reply.
///
/// A usable reply carries a confidence in (0, 1]; anything else is an invalid response.
pub fn parse_reply(
    collaborator: Collaborator,
    reply: Value,
) -> Result<CollaboratorResult, CollaboratorError> {
    let confidence = reply
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            CollaboratorError::invalid_response(collaborator, "missing numeric confidence")
        })?;

    if !(confidence > 0.0 && confidence <= 1.0) {
        return Err(CollaboratorError::invalid_response(
            collaborator,
            format!("confidence {confidence} outside (0, 1]"),
        ));
    }

    let findings = match reply.get("findings") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(_) => {
            return Err(CollaboratorError::invalid_response(
                collaborator,
                "findings must be a list of strings",
            ));
        }
    };

    Ok(CollaboratorResult::success(
        collaborator,
        reply,
        confidence,
        findings,
    ))
}

/// Fields every collaborator receives about the patient.
fn patient_context(request: &DiagnosisRequest, session_id: &str) -> Value {
    json!({
        "user_id": request.user_id,
        "session_id": session_id,
        "profile": request.profile,
        "chief_complaint": request.chief_complaint,
        "symptoms": request.symptoms,
    })
}

fn with_field(mut base: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut base {
        map.insert(key.to_string(), value);
    }
    base
}
