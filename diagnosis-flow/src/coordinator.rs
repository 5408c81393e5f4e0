//! DiagnosisCoordinator drives one diagnosis through its phases and persists every step.
//!
//! A diagnosis moves `created → observing → calculating → {completed | partial | timeout}`,
//! or to `failed` when the request is invalid or no observation collaborator produced a
//! usable result.
//!
//! ## Observation
//! The four observation collaborators run concurrently on the caller's task, bounded by a
//! per-session semaphore. Each call is wrapped in its own resilience policy, so one
//! collaborator exhausting its retries never blocks the others. Each result is appended
//! to the session as it settles, which is what [`DiagnosisCoordinator::get_diagnosis_progress`]
//! reports, but the calculation input is built only once all four have settled.
//!
//! ## Deadline
//! A single deadline covers the whole diagnosis. When it expires, in-flight calls are
//! dropped (cancelling them), recorded as timeout failures, and the session ends `timeout`.
//!
//! ## Usage
//! ```rust,ignore
//! let coordinator = DiagnosisCoordinator::builder()
//!     .with_config(CoordinatorConfig::from_env())
//!     .with_service(inquiry)
//!     .with_service(look)
//!     .with_service(listen)
//!     .with_service(palpation)
//!     .with_service(calculation)
//!     .build()?;
//!
//! let result = coordinator.coordinate_diagnosis(&request).await?;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    aggregation::AggregationEngine,
    clients::{
        CalculationClient, DiagnosticClient, DiagnosticService, InquiryClient, ListenClient,
        LookClient, PalpationClient,
    },
    config::CoordinatorConfig,
    error::{CollaboratorError, DiagnosisError, Result},
    models::{Collaborator, CollaboratorResult, DiagnosisRequest, DiagnosisResult},
    resilience::ResilienceStatus,
    storage::{
        DiagnosisPhase, DiagnosisProgress, DiagnosisSession, InMemorySessionStorage,
        SessionStatus, SessionStorage,
    },
};

/// Liveness of one collaborator as seen by [`DiagnosisCoordinator::check_services_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
}

pub struct DiagnosisCoordinator {
    inquiry: InquiryClient,
    look: LookClient,
    listen: ListenClient,
    palpation: PalpationClient,
    calculation: CalculationClient,
    storage: Arc<dyn SessionStorage>,
    aggregation: AggregationEngine,
    config: CoordinatorConfig,
}

#[derive(Default)]
pub struct DiagnosisCoordinatorBuilder {
    config: CoordinatorConfig,
    services: BTreeMap<Collaborator, Arc<dyn DiagnosticService>>,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl DiagnosisCoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the transport for the collaborator the service reports.
    pub fn with_service(mut self, service: Arc<dyn DiagnosticService>) -> Self {
        self.services.insert(service.collaborator(), service);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<DiagnosisCoordinator> {
        let Self {
            config,
            mut services,
            storage,
        } = self;

        let mut take = |collaborator: Collaborator| {
            services.remove(&collaborator).ok_or_else(|| {
                DiagnosisError::Configuration(format!("no service registered for {collaborator}"))
            })
        };

        let inquiry = take(Collaborator::Inquiry)?;
        let look = take(Collaborator::Look)?;
        let listen = take(Collaborator::Listen)?;
        let palpation = take(Collaborator::Palpation)?;
        let calculation = take(Collaborator::Calculation)?;

        Ok(DiagnosisCoordinator {
            inquiry: InquiryClient::new(inquiry, config.resilience_for(Collaborator::Inquiry)),
            look: LookClient::new(look, config.resilience_for(Collaborator::Look)),
            listen: ListenClient::new(listen, config.resilience_for(Collaborator::Listen)),
            palpation: PalpationClient::new(
                palpation,
                config.resilience_for(Collaborator::Palpation),
            ),
            calculation: CalculationClient::new(
                calculation,
                config.resilience_for(Collaborator::Calculation),
            ),
            storage: storage.unwrap_or_else(|| Arc::new(InMemorySessionStorage::new())),
            aggregation: AggregationEngine::new(config.aggregation.clone()),
            config,
        })
    }
}

// Stand-in deadline for budgets too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Wall clock of one diagnosis.
struct SessionClock {
    started: Instant,
    deadline: Instant,
    budget: Duration,
}

impl SessionClock {
    fn start(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started
                .checked_add(budget)
                .unwrap_or_else(|| started + FAR_FUTURE),
            budget,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn deadline_error(&self, collaborator: Collaborator) -> CollaboratorError {
        CollaboratorError::Timeout {
            collaborator,
            timeout_ms: self.budget.as_millis() as u64,
        }
    }
}

/// How a diagnosis ends.
struct Verdict {
    phase: DiagnosisPhase,
    message: Option<String>,
}

impl Verdict {
    fn new(phase: DiagnosisPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
        }
    }
}

struct Observation {
    results: Vec<CollaboratorResult>,
    deadline_exceeded: bool,
}

impl DiagnosisCoordinator {
    pub fn builder() -> DiagnosisCoordinatorBuilder {
        DiagnosisCoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Run a full diagnosis under the configured overall deadline.
    pub async fn coordinate_diagnosis(&self, request: &DiagnosisRequest) -> Result<DiagnosisResult> {
        self.coordinate_diagnosis_with_deadline(request, self.config.overall_deadline)
            .await
    }

    /// Run a full diagnosis that must finish within `budget`.
    ///
    /// Collaborator failures never surface as `Err`; they are recorded on the session and
    /// reflected in the terminal status. `Err` is reserved for session store problems, such
    /// as a caller-supplied `session_id` that is already taken.
    pub async fn coordinate_diagnosis_with_deadline(
        &self,
        request: &DiagnosisRequest,
        budget: Duration,
    ) -> Result<DiagnosisResult> {
        let clock = SessionClock::start(budget);
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Err(error) = request.validate() {
            return self.reject(request, session_id, error, &clock).await;
        }

        self.storage
            .create(DiagnosisSession::new(&session_id, &request.user_id))
            .await?;
        info!(
            session_id = %session_id,
            user_id = %request.user_id,
            deadline_ms = budget.as_millis() as u64,
            "Starting diagnosis"
        );

        self.transition(&session_id, DiagnosisPhase::Observing).await?;
        let Observation {
            mut results,
            deadline_exceeded,
        } = self.observe(request, &session_id, &clock).await?;
        let successes = results.iter().filter(|r| r.is_success()).count();

        let verdict = if deadline_exceeded {
            Verdict::new(
                DiagnosisPhase::Timeout,
                format!(
                    "overall deadline of {} ms exceeded during observation",
                    budget.as_millis()
                ),
            )
        } else if successes == 0 {
            Verdict::new(
                DiagnosisPhase::Failed,
                "no observation collaborator produced a usable result",
            )
        } else {
            self.transition(&session_id, DiagnosisPhase::Calculating)
                .await?;
            let (calculation, verdict) = self
                .calculate(request, &session_id, &results, &clock)
                .await?;
            results.push(calculation);
            verdict
        };

        self.finalize(request, &session_id, &results, verdict, &clock)
            .await
    }

    async fn observe(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
        clock: &SessionClock,
    ) -> Result<Observation> {
        let limiter = Semaphore::new(self.config.max_parallel_calls.max(1));

        let (inquiry, look, listen, palpation) = tokio::join!(
            self.observe_one(
                Collaborator::Inquiry,
                self.inquiry.conduct_inquiry(request, session_id),
                &limiter,
                session_id,
                clock,
            ),
            self.observe_one(
                Collaborator::Look,
                self.look.analyze_appearance(request, session_id),
                &limiter,
                session_id,
                clock,
            ),
            self.observe_one(
                Collaborator::Listen,
                self.listen.analyze_sounds(request, session_id),
                &limiter,
                session_id,
                clock,
            ),
            self.observe_one(
                Collaborator::Palpation,
                self.palpation.analyze_pulse(request, session_id),
                &limiter,
                session_id,
                clock,
            ),
        );

        let settled = [inquiry?, look?, listen?, palpation?];
        let deadline_exceeded = settled.iter().any(|(_, expired)| *expired);

        Ok(Observation {
            results: settled.into_iter().map(|(result, _)| result).collect(),
            deadline_exceeded,
        })
    }

    /// Settle one observation call and record it. The flag is set when the deadline cut it off.
    async fn observe_one<Fut>(
        &self,
        collaborator: Collaborator,
        call: Fut,
        limiter: &Semaphore,
        session_id: &str,
        clock: &SessionClock,
    ) -> Result<(CollaboratorResult, bool)>
    where
        Fut: Future<Output = std::result::Result<CollaboratorResult, CollaboratorError>>,
    {
        let started = Instant::now();
        let bounded = async {
            let _permit = limiter.acquire().await.map_err(|_| {
                CollaboratorError::unavailable(collaborator, "call limiter closed")
            })?;
            call.await
        };

        let (result, expired) = match timeout_at(clock.deadline, bounded).await {
            Ok(Ok(result)) => (result, false),
            Ok(Err(error)) => {
                warn!(
                    session_id = %session_id,
                    collaborator = %collaborator,
                    kind = %error.kind(),
                    error = %error,
                    "Observation collaborator failed"
                );
                (
                    CollaboratorResult::failure(collaborator, &error)
                        .with_processing_time(started.elapsed()),
                    false,
                )
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    collaborator = %collaborator,
                    "Overall deadline reached before collaborator responded"
                );
                (
                    CollaboratorResult::failure(collaborator, &clock.deadline_error(collaborator))
                        .with_processing_time(started.elapsed()),
                    true,
                )
            }
        };

        self.record(session_id, result.clone()).await?;
        Ok((result, expired))
    }

    async fn calculate(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
        observations: &[CollaboratorResult],
        clock: &SessionClock,
    ) -> Result<(CollaboratorResult, Verdict)> {
        let started = Instant::now();
        let successes = observations.iter().filter(|r| r.is_success()).count();
        let call = self
            .calculation
            .calculate_patterns(request, session_id, observations);

        let (result, verdict) = match timeout_at(clock.deadline, call).await {
            Ok(Ok(result)) if successes == Collaborator::OBSERVATION.len() => (
                result,
                Verdict {
                    phase: DiagnosisPhase::Completed,
                    message: None,
                },
            ),
            Ok(Ok(result)) => (
                result,
                Verdict::new(
                    DiagnosisPhase::Partial,
                    format!(
                        "{successes} of {} observation collaborators succeeded",
                        Collaborator::OBSERVATION.len()
                    ),
                ),
            ),
            Ok(Err(error)) => {
                warn!(
                    session_id = %session_id,
                    kind = %error.kind(),
                    error = %error,
                    "Calculation collaborator failed"
                );
                let message = format!("calculation failed: {error}");
                (
                    CollaboratorResult::failure(Collaborator::Calculation, &error)
                        .with_processing_time(started.elapsed()),
                    Verdict::new(DiagnosisPhase::Partial, message),
                )
            }
            Err(_) => {
                warn!(session_id = %session_id, "Overall deadline reached during calculation");
                (
                    CollaboratorResult::failure(
                        Collaborator::Calculation,
                        &clock.deadline_error(Collaborator::Calculation),
                    )
                    .with_processing_time(started.elapsed()),
                    Verdict::new(
                        DiagnosisPhase::Timeout,
                        format!(
                            "overall deadline of {} ms exceeded during calculation",
                            clock.budget.as_millis()
                        ),
                    ),
                )
            }
        };

        self.record(session_id, result.clone()).await?;
        Ok((result, verdict))
    }

    async fn finalize(
        &self,
        request: &DiagnosisRequest,
        session_id: &str,
        results: &[CollaboratorResult],
        verdict: Verdict,
        clock: &SessionClock,
    ) -> Result<DiagnosisResult> {
        let outcome = self.aggregation.aggregate(results);
        let phase = verdict.phase;
        let confidence = outcome.overall_confidence;
        let message = verdict.message.clone();

        let session = self
            .storage
            .update(
                session_id,
                Box::new(move |session| {
                    session.advance(phase)?;
                    session.overall_confidence = confidence;
                    session.status_message = message;
                    Ok(())
                }),
            )
            .await?;

        let processing_time_ms = clock.elapsed_ms();
        info!(
            session_id = %session_id,
            status = %session.status,
            overall_confidence = ?outcome.overall_confidence,
            data_quality_score = outcome.data_quality_score,
            primary_findings = outcome.primary_findings.len(),
            processing_time_ms,
            "Diagnosis finished"
        );

        Ok(DiagnosisResult {
            session_id: session.session_id,
            user_id: request.user_id.clone(),
            status: session.status,
            overall_confidence: outcome.overall_confidence,
            data_quality_score: outcome.data_quality_score,
            primary_findings: outcome.primary_findings,
            collaborator_results: session.results,
            error_message: verdict.message,
            processing_time_ms,
        })
    }

    /// Persist a rejected request as a failed session without calling any collaborator.
    async fn reject(
        &self,
        request: &DiagnosisRequest,
        session_id: String,
        error: DiagnosisError,
        clock: &SessionClock,
    ) -> Result<DiagnosisResult> {
        let message = error.to_string();
        warn!(session_id = %session_id, error = %message, "Rejecting diagnosis request");

        let mut session = DiagnosisSession::new(&session_id, &request.user_id);
        session.status_message = Some(message.clone());
        session.advance(DiagnosisPhase::Failed)?;
        self.storage.create(session).await?;

        Ok(DiagnosisResult {
            session_id,
            user_id: request.user_id.clone(),
            status: SessionStatus::Failed,
            overall_confidence: None,
            data_quality_score: 0.0,
            primary_findings: Vec::new(),
            collaborator_results: Vec::new(),
            error_message: Some(message),
            processing_time_ms: clock.elapsed_ms(),
        })
    }

    async fn transition(&self, session_id: &str, phase: DiagnosisPhase) -> Result<()> {
        self.storage
            .update(session_id, Box::new(move |session| session.advance(phase)))
            .await?;
        debug!(session_id = %session_id, phase = %phase, "Session phase changed");
        Ok(())
    }

    async fn record(&self, session_id: &str, result: CollaboratorResult) -> Result<()> {
        self.storage
            .update(session_id, Box::new(move |session| session.record(result)))
            .await?;
        Ok(())
    }

    /// Open an empty session, generating an id when none is given.
    pub async fn create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<DiagnosisSession> {
        if user_id.trim().is_empty() {
            return Err(DiagnosisError::Validation(
                "user_id must not be empty".to_string(),
            ));
        }
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let session = DiagnosisSession::new(session_id, user_id);
        self.storage.create(session.clone()).await?;
        info!(session_id = %session.session_id, user_id = %user_id, "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<DiagnosisSession>> {
        self.storage.get(session_id).await
    }

    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<DiagnosisSession> {
        let session = self
            .storage
            .update(session_id, Box::new(move |session| session.set_status(status)))
            .await?;
        info!(session_id = %session_id, status = %status, "Session status updated");
        Ok(session)
    }

    /// Discard a session. Returns whether it existed.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.storage.delete(session_id).await?;
        if removed {
            info!(session_id = %session_id, "Session cleaned up");
        }
        Ok(removed)
    }

    pub async fn get_diagnosis_progress(&self, session_id: &str) -> Result<DiagnosisProgress> {
        self.storage
            .get(session_id)
            .await?
            .map(|session| session.progress())
            .ok_or_else(|| DiagnosisError::SessionNotFound(session_id.to_string()))
    }

    /// Probe every collaborator concurrently, bounded by the health check timeout.
    pub async fn check_services_health(&self) -> BTreeMap<Collaborator, ServiceHealth> {
        let (inquiry, look, listen, palpation, calculation) = tokio::join!(
            self.probe(Collaborator::Inquiry),
            self.probe(Collaborator::Look),
            self.probe(Collaborator::Listen),
            self.probe(Collaborator::Palpation),
            self.probe(Collaborator::Calculation),
        );

        BTreeMap::from([
            (Collaborator::Inquiry, inquiry),
            (Collaborator::Look, look),
            (Collaborator::Listen, listen),
            (Collaborator::Palpation, palpation),
            (Collaborator::Calculation, calculation),
        ])
    }

    async fn probe(&self, collaborator: Collaborator) -> ServiceHealth {
        let service = self.client(collaborator).service();
        match tokio::time::timeout(self.config.health_check_timeout, service.health()).await {
            Ok(Ok(())) => ServiceHealth::Healthy,
            Ok(Err(error)) => {
                warn!(collaborator = %collaborator, error = %error, "Health check failed");
                ServiceHealth::Unhealthy
            }
            Err(_) => {
                warn!(collaborator = %collaborator, "Health check timed out");
                ServiceHealth::Unhealthy
            }
        }
    }

    /// Resilience state of every collaborator, for observability.
    pub fn policy_status(&self) -> BTreeMap<Collaborator, ResilienceStatus> {
        Collaborator::ALL
            .into_iter()
            .map(|c| (c, self.client(c).status()))
            .collect()
    }

    fn client(&self, collaborator: Collaborator) -> &DiagnosticClient {
        match collaborator {
            Collaborator::Inquiry => self.inquiry.client(),
            Collaborator::Look => self.look.client(),
            Collaborator::Listen => self.listen.client(),
            Collaborator::Palpation => self.palpation.client(),
            Collaborator::Calculation => self.calculation.client(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resilience::{
        BackoffStrategy, CircuitState, ResilienceConfig, RetryConfig,
    };
    use crate::test_support::{Behavior, MockService};

    struct Fixture {
        coordinator: DiagnosisCoordinator,
        mocks: BTreeMap<Collaborator, Arc<MockService>>,
    }

    impl Fixture {
        fn mock(&self, collaborator: Collaborator) -> &MockService {
            &self.mocks[&collaborator]
        }
    }

    fn fast_policy() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                max_attempts: 2,
                strategy: BackoffStrategy::Fixed,
                base_delay: Duration::from_millis(100),
                jitter: false,
                ..RetryConfig::default()
            },
            ..ResilienceConfig::default()
        }
    }

    fn default_mocks() -> BTreeMap<Collaborator, Arc<MockService>> {
        BTreeMap::from([
            (
                Collaborator::Inquiry,
                MockService::succeeding(Collaborator::Inquiry, 0.8, &["Fatigue", "night sweats"]),
            ),
            (
                Collaborator::Look,
                MockService::succeeding(Collaborator::Look, 0.6, &["fatigue", "pale tongue"]),
            ),
            (
                Collaborator::Listen,
                MockService::succeeding(Collaborator::Listen, 0.7, &["weak voice"]),
            ),
            (
                Collaborator::Palpation,
                MockService::succeeding(Collaborator::Palpation, 0.9, &["fatigue", "thready pulse"]),
            ),
            (
                Collaborator::Calculation,
                MockService::succeeding(
                    Collaborator::Calculation,
                    0.75,
                    &["qi deficiency", "pale tongue"],
                ),
            ),
        ])
    }

    fn fixture(overrides: Vec<Arc<MockService>>) -> Fixture {
        fixture_with_config(overrides, CoordinatorConfig::default())
    }

    fn fixture_with_config(
        overrides: Vec<Arc<MockService>>,
        mut config: CoordinatorConfig,
    ) -> Fixture {
        let mut mocks = default_mocks();
        for mock in overrides {
            mocks.insert(mock.collaborator(), mock);
        }

        for collaborator in Collaborator::ALL {
            config = config.with_policy(collaborator, fast_policy());
        }

        let mut builder = DiagnosisCoordinator::builder().with_config(config);
        for mock in mocks.values() {
            builder = builder.with_service(mock.clone());
        }

        Fixture {
            coordinator: builder.build().unwrap(),
            mocks,
        }
    }

    fn request() -> DiagnosisRequest {
        DiagnosisRequest::new(
            "user-1",
            vec!["fatigue".to_string(), "night sweats".to_string()],
        )
    }

    fn total_calls(fixture: &Fixture) -> u32 {
        fixture.mocks.values().map(|m| m.calls()).sum()
    }

    #[tokio::test]
    async fn test_invalid_request_fails_without_calls() {
        let fixture = fixture(vec![]);

        for bad in [
            DiagnosisRequest::new("", vec!["fatigue".to_string()]),
            DiagnosisRequest::new("user-1", vec![]),
            DiagnosisRequest::new("user-1", vec!["  ".to_string()]),
        ] {
            let result = fixture.coordinator.coordinate_diagnosis(&bad).await.unwrap();

            assert_eq!(result.status, SessionStatus::Failed);
            assert!(result.error_message.is_some());
            assert_eq!(result.overall_confidence, None);

            let stored = fixture
                .coordinator
                .get_session(&result.session_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.phase, DiagnosisPhase::Failed);
        }

        assert_eq!(total_calls(&fixture), 0);
    }

    #[tokio::test]
    async fn test_error_message_names_failed_field() {
        let fixture = fixture(vec![]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&DiagnosisRequest::new("user-1", vec![]))
            .await
            .unwrap();

        assert!(result.error_message.unwrap().contains("symptoms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_collaborators_succeed() {
        let fixture = fixture(vec![]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&request().with_session_id("session-ok"))
            .await
            .unwrap();

        assert_eq!(result.session_id, "session-ok");
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.collaborator_results.len(), 5);
        assert_eq!(result.data_quality_score, 1.0);
        assert_eq!(result.error_message, None);
        // (0.8 + 0.6 + 0.7 + 0.9 + 2 * 0.75) / 6
        assert!((result.overall_confidence.unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(result.primary_findings[0].finding, "fatigue");

        let progress = fixture
            .coordinator
            .get_diagnosis_progress("session-ok")
            .await
            .unwrap();
        assert_eq!(progress.phase, DiagnosisPhase::Completed);
        assert_eq!(progress.completed.len(), 5);
        assert!(progress.failed.is_empty());
        assert_eq!(progress.overall_progress, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_unavailable_collaborator_is_partial() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Listen,
            Behavior::Fail(ErrorKind::Unavailable),
        )]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&request())
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Partial);
        // Listen excluded: (0.8 + 0.6 + 0.9 + 2 * 0.75) / 5
        assert!((result.overall_confidence.unwrap() - 0.76).abs() < 1e-9);
        assert!((result.data_quality_score - 0.8).abs() < 1e-9);

        let listen = result.result_for(Collaborator::Listen).unwrap();
        assert_eq!(
            listen.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Unavailable)
        );
        assert_eq!(fixture.mock(Collaborator::Listen).calls(), 2);

        let calculation_input = fixture.mock(Collaborator::Calculation).last_input().unwrap();
        let observations = calculation_input["observations"].as_object().unwrap();
        assert_eq!(observations.len(), 3);
        assert!(!observations.contains_key("listen"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Look,
            Behavior::FailTimes(1),
        )]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&request())
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(fixture.mock(Collaborator::Look).calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_observation_success_fails_without_calculation() {
        let fixture = fixture(
            Collaborator::OBSERVATION
                .into_iter()
                .map(|c| MockService::new(c, Behavior::Fail(ErrorKind::InvalidInput)))
                .collect(),
        );
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&request())
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.overall_confidence, None);
        assert_eq!(result.collaborator_results.len(), 4);
        assert_eq!(fixture.mock(Collaborator::Calculation).calls(), 0);
        // Invalid input is never retried.
        assert_eq!(fixture.mock(Collaborator::Inquiry).calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calculation_failure_is_partial() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Calculation,
            Behavior::Malformed,
        )]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis(&request())
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Partial);
        let calculation = result.result_for(Collaborator::Calculation).unwrap();
        assert_eq!(
            calculation.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::InvalidResponse)
        );
        // Observation results still count.
        assert!((result.overall_confidence.unwrap() - 0.75).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ends_session_as_timeout() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Look,
            Behavior::Sleep(Duration::from_secs(10)),
        )]);
        let started = Instant::now();
        let result = fixture
            .coordinator
            .coordinate_diagnosis_with_deadline(&request(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.processing_time_ms < 3000);

        let look = result.result_for(Collaborator::Look).unwrap();
        assert_eq!(look.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
        assert_eq!(fixture.mock(Collaborator::Calculation).calls(), 0);

        let session = fixture
            .coordinator
            .get_session(&result.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.phase, DiagnosisPhase::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_calculation_is_timeout() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Calculation,
            Behavior::Sleep(Duration::from_secs(10)),
        )]);
        let started = Instant::now();
        let result = fixture
            .coordinator
            .coordinate_diagnosis_with_deadline(&request(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Timeout);
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(100));
        assert_eq!(fixture.mock(Collaborator::Calculation).calls(), 1);

        let calculation = result.result_for(Collaborator::Calculation).unwrap();
        assert_eq!(
            calculation.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Timeout)
        );
        assert!(
            Collaborator::OBSERVATION
                .iter()
                .all(|c| result.result_for(*c).is_some_and(|r| r.is_success()))
        );
        assert!(result.error_message.unwrap().contains("calculation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_does_not_overflow() {
        let fixture = fixture(vec![]);
        let result = fixture
            .coordinator
            .coordinate_diagnosis_with_deadline(&request(), Duration::MAX)
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_call_limit_serializes_observation() {
        let sleepers = || {
            Collaborator::OBSERVATION
                .into_iter()
                .map(|c| MockService::new(c, Behavior::Sleep(Duration::from_secs(1))))
                .collect::<Vec<_>>()
        };

        let serial = fixture_with_config(
            sleepers(),
            CoordinatorConfig {
                max_parallel_calls: 1,
                ..CoordinatorConfig::default()
            },
        );
        let started = Instant::now();
        let result = serial.coordinator.coordinate_diagnosis(&request()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, SessionStatus::Completed);
        assert!(elapsed >= Duration::from_secs(4), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");

        let parallel = fixture(sleepers());
        let started = Instant::now();
        parallel.coordinator.coordinate_diagnosis(&request()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_are_independent() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Palpation,
            Behavior::Fail(ErrorKind::Unavailable),
        )]);
        let coordinator = &fixture.coordinator;
        let (first, second, third) = (
            request().with_session_id("s-1"),
            request().with_session_id("s-2"),
            request().with_session_id("s-3"),
        );

        let (a, b, c) = tokio::join!(
            coordinator.coordinate_diagnosis(&first),
            coordinator.coordinate_diagnosis(&second),
            coordinator.coordinate_diagnosis(&third),
        );

        for (result, id) in [(a.unwrap(), "s-1"), (b.unwrap(), "s-2"), (c.unwrap(), "s-3")] {
            assert_eq!(result.session_id, id);
            assert_eq!(result.status, SessionStatus::Partial);

            let session = coordinator.get_session(id).await.unwrap().unwrap();
            assert_eq!(session.session_id, id);
            assert_eq!(session.results.len(), 5);
            assert_eq!(session.status, SessionStatus::Partial);
        }
        assert_eq!(coordinator.storage().len().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_session_id_is_rejected() {
        let fixture = fixture(vec![]);
        fixture
            .coordinator
            .create_session("user-1", Some("taken"))
            .await
            .unwrap();

        let err = fixture
            .coordinator
            .coordinate_diagnosis(&request().with_session_id("taken"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::SessionExists(_)));
        assert_eq!(total_calls(&fixture), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_with_taken_session_id_is_rejected() {
        let fixture = fixture(vec![]);
        fixture
            .coordinator
            .create_session("user-1", Some("taken"))
            .await
            .unwrap();

        let invalid = DiagnosisRequest::new("user-2", vec![]).with_session_id("taken");
        let err = fixture
            .coordinator
            .coordinate_diagnosis(&invalid)
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::SessionExists(id) if id == "taken"));

        let existing = fixture.coordinator.get_session("taken").await.unwrap().unwrap();
        assert_eq!(existing.user_id, "user-1");
        assert_eq!(existing.status, SessionStatus::Active);
        assert_eq!(total_calls(&fixture), 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let fixture = fixture(vec![]);
        let coordinator = &fixture.coordinator;

        let generated = coordinator.create_session("user-1", None).await.unwrap();
        assert!(!generated.session_id.is_empty());

        let session = coordinator
            .create_session("user-2", Some("manual"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let progress = coordinator.get_diagnosis_progress("manual").await.unwrap();
        assert_eq!(progress.phase, DiagnosisPhase::Created);
        assert_eq!(progress.overall_progress, 0.0);

        let updated = coordinator
            .update_session_status("manual", SessionStatus::Failed)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Failed);

        let err = coordinator
            .update_session_status("manual", SessionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosisError::InvalidTransition { .. }));

        assert!(coordinator.cleanup_session("manual").await.unwrap());
        assert!(!coordinator.cleanup_session("manual").await.unwrap());
        assert!(coordinator.get_session("manual").await.unwrap().is_none());

        let err = coordinator.get_diagnosis_progress("manual").await.unwrap_err();
        assert!(matches!(err, DiagnosisError::SessionNotFound(_)));

        let err = coordinator.create_session(" ", None).await.unwrap_err();
        assert!(matches!(err, DiagnosisError::Validation(_)));
    }

    #[tokio::test]
    async fn test_health_check_reports_each_collaborator() {
        let fixture = fixture(vec![MockService::unhealthy(Collaborator::Look)]);
        let health = fixture.coordinator.check_services_health().await;

        assert_eq!(health.len(), 5);
        assert_eq!(health[&Collaborator::Look], ServiceHealth::Unhealthy);
        assert_eq!(health[&Collaborator::Calculation], ServiceHealth::Healthy);
        assert_eq!(total_calls(&fixture), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_status_reflects_breaker() {
        let fixture = fixture(vec![MockService::new(
            Collaborator::Look,
            Behavior::Fail(ErrorKind::Unavailable),
        )]);
        fixture
            .coordinator
            .coordinate_diagnosis(&request())
            .await
            .unwrap();

        let status = fixture.coordinator.policy_status();
        assert_eq!(status.len(), 5);
        assert_eq!(status[&Collaborator::Look].circuit_breaker.failure_count, 2);
        assert_eq!(
            status[&Collaborator::Inquiry].circuit_breaker.state,
            CircuitState::Closed
        );
    }

    #[test]
    fn test_builder_requires_every_collaborator() {
        let err = DiagnosisCoordinator::builder()
            .with_service(MockService::succeeding(Collaborator::Inquiry, 0.5, &[]))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, DiagnosisError::Configuration(msg) if msg.contains("look")));
    }
}
