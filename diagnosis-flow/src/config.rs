use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::{aggregation::AggregationConfig, models::Collaborator, resilience::ResilienceConfig};

/// Settings for a [`DiagnosisCoordinator`](crate::coordinator::DiagnosisCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Deadline for one whole diagnosis, observation and calculation included.
    pub overall_deadline: Duration,
    /// Upper bound on in-flight collaborator calls within one session.
    pub max_parallel_calls: usize,
    pub health_check_timeout: Duration,
    pub aggregation: AggregationConfig,
    pub policies: BTreeMap<Collaborator, ResilienceConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            overall_deadline: Duration::from_secs(30),
            max_parallel_calls: Collaborator::OBSERVATION.len(),
            health_check_timeout: Duration::from_secs(5),
            aggregation: AggregationConfig::default(),
            policies: Collaborator::ALL
                .into_iter()
                .map(|c| (c, ResilienceConfig::for_collaborator(c)))
                .collect(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by `DIAGNOSIS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parsed::<u64>(&lookup, "DIAGNOSIS_DEADLINE_MS") {
            config.overall_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = parsed::<usize>(&lookup, "DIAGNOSIS_MAX_PARALLEL_CALLS") {
            config.max_parallel_calls = n.max(1);
        }
        if let Some(ms) = parsed::<u64>(&lookup, "DIAGNOSIS_HEALTH_TIMEOUT_MS") {
            config.health_check_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parsed::<usize>(&lookup, "DIAGNOSIS_MIN_CORROBORATION") {
            config.aggregation.min_corroboration = n.max(1);
        }

        for collaborator in Collaborator::ALL {
            let prefix = format!("DIAGNOSIS_{}", collaborator.as_str().to_uppercase());
            let policy = config
                .policies
                .entry(collaborator)
                .or_insert_with(|| ResilienceConfig::for_collaborator(collaborator));

            if let Some(ms) = parsed::<u64>(&lookup, &format!("{prefix}_TIMEOUT_MS")) {
                policy.call_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = parsed::<u32>(&lookup, &format!("{prefix}_MAX_ATTEMPTS")) {
                policy.retry.max_attempts = n.max(1);
            }
            if let Some(n) = parsed::<u32>(&lookup, &format!("{prefix}_FAILURE_THRESHOLD")) {
                policy.circuit_breaker.failure_threshold = n.max(1);
            }
            if let Some(ms) = parsed::<u64>(&lookup, &format!("{prefix}_RECOVERY_TIMEOUT_MS")) {
                policy.circuit_breaker.recovery_timeout = Duration::from_millis(ms);
            }
        }

        config
    }

    pub fn resilience_for(&self, collaborator: Collaborator) -> ResilienceConfig {
        self.policies
            .get(&collaborator)
            .cloned()
            .unwrap_or_else(|| ResilienceConfig::for_collaborator(collaborator))
    }

    pub fn with_overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = deadline;
        self
    }

    pub fn with_policy(mut self, collaborator: Collaborator, policy: ResilienceConfig) -> Self {
        self.policies.insert(collaborator, policy);
        self
    }
}

// Unparseable values are ignored so a typo never prevents startup.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse().ok())
}
