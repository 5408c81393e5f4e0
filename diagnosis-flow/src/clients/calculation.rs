use serde_json::{Map, Value};
use std::sync::Arc;

use super::{DiagnosticClient, DiagnosticService, patient_context, with_field};
use crate::{
    error::CollaboratorError,
    models::{CollaboratorResult, DiagnosisRequest},
    resilience::ResilienceConfig,
};

/// Client for the calculation (syndrome and constitution) service.
///
/// Receives whichever observation results succeeded, keyed by collaborator name.
pub struct CalculationClient {
    client: DiagnosticClient,
}

impl CalculationClient {
    pub fn new(service: Arc<dyn DiagnosticService>, config: ResilienceConfig) -> Self {
        Self {
            client: DiagnosticClient::new(service, config),
        }
    }

    pub fn client(&self) -> &DiagnosticClient {
        &self.client
    }

    pub async fn calculate_patterns(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
        observations: &[CollaboratorResult],
    ) -> Result<CollaboratorResult, CollaboratorError> {
        let mut by_collaborator = Map::new();
        for result in observations.iter().filter(|r| r.is_success()) {
            by_collaborator.insert(
                result.collaborator.to_string(),
                serde_json::json!({
                    "confidence": result.confidence,
                    "findings": result.findings,
                    "payload": result.payload,
                }),
            );
        }

        let input = with_field(
            patient_context(request, session_id),
            "observations",
            Value::Object(by_collaborator),
        );
        self.client.invoke(input).await
    }
}
