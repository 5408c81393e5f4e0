use serde_json::Value;
use std::sync::Arc;

use super::{DiagnosticClient, DiagnosticService, patient_context, with_field};
use crate::{
    error::CollaboratorError,
    models::{CollaboratorResult, DiagnosisRequest},
    resilience::ResilienceConfig,
};

/// Client for the look (face and tongue imagery) service.
pub struct LookClient {
    client: DiagnosticClient,
}

impl LookClient {
    pub fn new(service: Arc<dyn DiagnosticService>, config: ResilienceConfig) -> Self {
        Self {
            client: DiagnosticClient::new(service, config),
        }
    }

    pub fn client(&self) -> &DiagnosticClient {
        &self.client
    }

    pub async fn analyze_appearance(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
    ) -> Result<CollaboratorResult, CollaboratorError> {
        let imagery = request.look_data.clone().unwrap_or(Value::Null);
        let input = with_field(patient_context(request, session_id), "imagery", imagery);
        self.client.invoke(input).await
    }
}
