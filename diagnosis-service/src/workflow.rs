use diagnosis_flow::{
    Collaborator, CoordinatorConfig, DiagnosisCoordinator, DiagnosisError, DiagnosisRequest,
    HttpDiagnosticService, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Base URL of every collaborator, read from `<NAME>_SERVICE_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    urls: BTreeMap<Collaborator, String>,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            urls: Collaborator::ALL
                .into_iter()
                .map(|c| (c, default_url(c).to_string()))
                .collect(),
        }
    }
}

fn default_url(collaborator: Collaborator) -> &'static str {
    match collaborator {
        Collaborator::Inquiry => "http://inquiry-service:8001",
        Collaborator::Look => "http://look-service:8080",
        Collaborator::Listen => "http://listen-service:8000",
        Collaborator::Palpation => "http://palpation-service:8002",
        Collaborator::Calculation => "http://calculation-service:8003",
    }
}

impl ServiceEndpoints {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut endpoints = Self::default();
        for collaborator in Collaborator::ALL {
            let key = format!("{}_SERVICE_URL", collaborator.as_str().to_uppercase());
            if let Some(url) = lookup(&key).filter(|url| !url.trim().is_empty()) {
                endpoints.urls.insert(collaborator, url.trim().to_string());
            }
        }
        endpoints
    }

    pub fn url(&self, collaborator: Collaborator) -> &str {
        self.urls
            .get(&collaborator)
            .map(String::as_str)
            .unwrap_or_else(|| default_url(collaborator))
    }
}

/// Wire an HTTP-backed coordinator. Each transport times out slightly after the
/// policy's own per-call timeout so the policy reports the overrun.
pub fn build_coordinator(
    endpoints: &ServiceEndpoints,
    config: CoordinatorConfig,
) -> Result<DiagnosisCoordinator> {
    let mut builder = DiagnosisCoordinator::builder();
    for collaborator in Collaborator::ALL {
        let call_timeout = config.resilience_for(collaborator).call_timeout;
        let service = HttpDiagnosticService::new(
            collaborator,
            endpoints.url(collaborator),
            call_timeout + std::time::Duration::from_secs(1),
        )?;
        builder = builder.with_service(Arc::new(service));
    }
    builder.with_config(config).build()
}

pub fn read_request(raw: &str) -> Result<DiagnosisRequest> {
    if raw.trim().is_empty() {
        return Err(DiagnosisError::Validation(
            "empty diagnosis request".to_string(),
        ));
    }
    Ok(serde_json::from_str(raw)?)
}
