use serde_json::json;
use std::sync::Arc;

use super::{DiagnosticClient, DiagnosticService, patient_context, with_field};
use crate::{
    error::CollaboratorError,
    models::{CollaboratorResult, DiagnosisRequest},
    resilience::ResilienceConfig,
};

/// Client for the inquiry (symptom interview) service.
pub struct InquiryClient {
    client: DiagnosticClient,
}

impl InquiryClient {
    pub fn new(service: Arc<dyn DiagnosticService>, config: ResilienceConfig) -> Self {
        Self {
            client: DiagnosticClient::new(service, config),
        }
    }

    pub fn client(&self) -> &DiagnosticClient {
        &self.client
    }

    pub async fn conduct_inquiry(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
    ) -> Result<CollaboratorResult, CollaboratorError> {
        let input = with_field(
            patient_context(request, session_id),
            "history",
            json!({
                "medical_history": request.medical_history,
                "current_medications": request.current_medications,
                "lifestyle": request.lifestyle,
            }),
        );
        self.client.invoke(input).await
    }
}
