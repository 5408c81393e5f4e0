use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::DiagnosticService;
use crate::{
    error::{CollaboratorError, DiagnosisError, Result},
    models::Collaborator,
};

/// JSON-over-HTTP transport to a diagnostic service.
///
/// Posts the request to `<base_url>/api/v1/<collaborator>/analyze` and probes
/// `<base_url>/health`.
pub struct HttpDiagnosticService {
    collaborator: Collaborator,
    base_url: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HttpDiagnosticService {
    pub fn new(
        collaborator: Collaborator,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DiagnosisError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            collaborator,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            client,
        })
    }

    pub fn analyze_url(&self) -> String {
        format!("{}/api/v1/{}/analyze", self.base_url, self.collaborator)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    fn transport_error(&self, error: reqwest::Error) -> CollaboratorError {
        if error.is_timeout() {
            CollaboratorError::Timeout {
                collaborator: self.collaborator,
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else if error.is_decode() {
            CollaboratorError::invalid_response(self.collaborator, error.to_string())
        } else {
            CollaboratorError::unavailable(self.collaborator, error.to_string())
        }
    }
}

/// Map a non-success HTTP status to the failure taxonomy.
pub fn classify_status(collaborator: Collaborator, status: StatusCode) -> Option<CollaboratorError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(CollaboratorError::unavailable(
            collaborator,
            format!("HTTP {status}"),
        ))
    } else if status.is_client_error() {
        Some(CollaboratorError::invalid_input(
            collaborator,
            format!("HTTP {status}"),
        ))
    } else {
        Some(CollaboratorError::invalid_response(
            collaborator,
            format!("unexpected HTTP {status}"),
        ))
    }
}

#[async_trait]
impl DiagnosticService for HttpDiagnosticService {
    fn collaborator(&self) -> Collaborator {
        self.collaborator
    }

    async fn call(&self, input: Value) -> std::result::Result<Value, CollaboratorError> {
        let url = self.analyze_url();
        debug!(collaborator = %self.collaborator, url = %url, "Calling diagnostic service");

        let response = self
            .client
            .post(&url)
            .json(&input)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Some(error) = classify_status(self.collaborator, response.status()) {
            return Err(error);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn health(&self) -> std::result::Result<(), CollaboratorError> {
        let response = self
            .client
            .get(self.health_url())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match classify_status(self.collaborator, response.status()) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}
