pub mod aggregation;
pub mod clients;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod resilience;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use aggregation::{AggregatedOutcome, AggregationConfig, AggregationEngine, RankedFinding};
#[cfg(feature = "http")]
pub use clients::HttpDiagnosticService;
pub use clients::{DiagnosticClient, DiagnosticService};
pub use config::CoordinatorConfig;
pub use coordinator::{DiagnosisCoordinator, DiagnosisCoordinatorBuilder, ServiceHealth};
pub use error::{CollaboratorError, DiagnosisError, ErrorKind, Result};
pub use models::{
    Collaborator, CollaboratorResult, DiagnosisRequest, DiagnosisResult, PatientProfile,
};
pub use resilience::{ResilienceConfig, ResiliencePolicy, ResilienceStatus};
pub use storage::{
    DiagnosisPhase, DiagnosisProgress, DiagnosisSession, InMemorySessionStorage, SessionStatus,
    SessionStorage,
};
