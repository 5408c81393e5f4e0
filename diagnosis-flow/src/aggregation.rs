//! Confidence-weighted aggregation of collaborator results.
//!
//! The outcome depends only on the set of results, never on their order:
//! inputs are put in a canonical order before any floating point sums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Collaborator, CollaboratorResult};

/// Relative weight of each collaborator in `overall_confidence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorWeights {
    pub inquiry: f64,
    pub look: f64,
    pub listen: f64,
    pub palpation: f64,
    pub calculation: f64,
}

impl Default for CollaboratorWeights {
    fn default() -> Self {
        Self {
            inquiry: 1.0,
            look: 1.0,
            listen: 1.0,
            palpation: 1.0,
            calculation: 2.0,
        }
    }
}

impl CollaboratorWeights {
    pub fn weight(&self, collaborator: Collaborator) -> f64 {
        match collaborator {
            Collaborator::Inquiry => self.inquiry,
            Collaborator::Look => self.look,
            Collaborator::Listen => self.listen,
            Collaborator::Palpation => self.palpation,
            Collaborator::Calculation => self.calculation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub weights: CollaboratorWeights,
    /// Distinct collaborators that must report a finding for it to be primary.
    pub min_corroboration: usize,
    /// Denominator of `data_quality_score`.
    pub expected_collaborators: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            weights: CollaboratorWeights::default(),
            min_corroboration: 2,
            expected_collaborators: Collaborator::ALL.len(),
        }
    }
}

/// A finding reported by several collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFinding {
    pub finding: String,
    pub collaborators: Vec<Collaborator>,
    pub mean_confidence: f64,
    pub first_reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOutcome {
    /// `None` means no collaborator produced a usable result, which is not the same as zero.
    pub overall_confidence: Option<f64>,
    pub primary_findings: Vec<RankedFinding>,
    pub data_quality_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationEngine {
    config: AggregationConfig,
}

struct Corroboration {
    collaborators: BTreeSet<Collaborator>,
    confidence_sum: f64,
    first_reported_at: DateTime<Utc>,
    first_reporter: Collaborator,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn aggregate(&self, results: &[CollaboratorResult]) -> AggregatedOutcome {
        let usable = canonical_successes(results);

        AggregatedOutcome {
            overall_confidence: self.overall_confidence(&usable),
            primary_findings: self.primary_findings(&usable),
            data_quality_score: self.data_quality(&usable),
        }
    }

    fn overall_confidence(&self, usable: &[&CollaboratorResult]) -> Option<f64> {
        let (weighted, total_weight) = usable.iter().fold((0.0, 0.0), |(sum, total), r| {
            let weight = self.config.weights.weight(r.collaborator).max(0.0);
            (sum + weight * r.confidence.clamp(0.0, 1.0), total + weight)
        });

        if usable.is_empty() {
            None
        } else if total_weight > 0.0 {
            Some((weighted / total_weight).clamp(0.0, 1.0))
        } else {
            // All weights zero: fall back to the plain mean.
            let mean = usable.iter().map(|r| r.confidence).sum::<f64>() / usable.len() as f64;
            Some(mean.clamp(0.0, 1.0))
        }
    }

    fn data_quality(&self, usable: &[&CollaboratorResult]) -> f64 {
        if self.config.expected_collaborators == 0 {
            return 0.0;
        }
        let distinct: BTreeSet<Collaborator> = usable.iter().map(|r| r.collaborator).collect();
        (distinct.len() as f64 / self.config.expected_collaborators as f64).min(1.0)
    }

    fn primary_findings(&self, usable: &[&CollaboratorResult]) -> Vec<RankedFinding> {
        let mut corroborations: BTreeMap<String, Corroboration> = BTreeMap::new();

        for result in usable {
            let findings: BTreeSet<String> = result
                .findings
                .iter()
                .map(|f| normalize_finding(f))
                .filter(|f| !f.is_empty())
                .collect();

            for finding in findings {
                let entry = corroborations
                    .entry(finding)
                    .or_insert_with(|| Corroboration {
                        collaborators: BTreeSet::new(),
                        confidence_sum: 0.0,
                        first_reported_at: result.completed_at,
                        first_reporter: result.collaborator,
                    });
                // Each collaborator counts once per finding.
                if entry.collaborators.insert(result.collaborator) {
                    entry.confidence_sum += result.confidence;
                    if (result.completed_at, result.collaborator)
                        < (entry.first_reported_at, entry.first_reporter)
                    {
                        entry.first_reported_at = result.completed_at;
                        entry.first_reporter = result.collaborator;
                    }
                }
            }
        }

        let min_corroboration = self.config.min_corroboration.max(1);
        let mut ranked: Vec<(RankedFinding, Collaborator)> = corroborations
            .into_iter()
            .filter(|(_, c)| c.collaborators.len() >= min_corroboration)
            .map(|(finding, c)| {
                let mean_confidence = c.confidence_sum / c.collaborators.len() as f64;
                (
                    RankedFinding {
                        finding,
                        collaborators: c.collaborators.into_iter().collect(),
                        mean_confidence,
                        first_reported_at: c.first_reported_at,
                    },
                    c.first_reporter,
                )
            })
            .collect();

        ranked.sort_by(|(a, a_reporter), (b, b_reporter)| {
            b.collaborators
                .len()
                .cmp(&a.collaborators.len())
                .then_with(|| b.mean_confidence.total_cmp(&a.mean_confidence))
                .then_with(|| a.first_reported_at.cmp(&b.first_reported_at))
                .then_with(|| a_reporter.cmp(b_reporter))
                .then_with(|| a.finding.cmp(&b.finding))
        });

        ranked.into_iter().map(|(finding, _)| finding).collect()
    }
}

/// Successful results in a fixed order, independent of input order.
fn canonical_successes(results: &[CollaboratorResult]) -> Vec<&CollaboratorResult> {
    let mut usable: Vec<&CollaboratorResult> = results.iter().filter(|r| r.is_success()).collect();
    usable.sort_by(|a, b| {
        a.collaborator
            .cmp(&b.collaborator)
            .then_with(|| a.confidence.total_cmp(&b.confidence))
            .then_with(|| a.completed_at.cmp(&b.completed_at))
            .then_with(|| a.findings.cmp(&b.findings))
    });
    usable
}

fn normalize_finding(finding: &str) -> String {
    finding.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
