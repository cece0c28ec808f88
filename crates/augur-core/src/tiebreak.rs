//! Deterministic tie-break resolution for conflicting discrete predictions.
//!
//! Agents are grouped by prediction (rounded to a fixed precision) and the
//! groups are ranked by:
//! 1. weight density (total weight / member count), higher first
//! 2. maximum reliability within the group, higher first
//! 3. prediction value, smaller first
//!
//! The third key is total, so the same input always yields the same winner.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from tie-break input construction and resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TieBreakError {
    #[error("Cannot resolve tie with empty agent list")]
    EmptyAgents,

    #[error("confidence must be in [0,1], got {value} (agent {agent_id})")]
    ConfidenceOutOfRange { agent_id: String, value: f64 },

    #[error("reliability_score must be in [0,1], got {value} (agent {agent_id})")]
    ReliabilityOutOfRange { agent_id: String, value: f64 },
}

/// A single agent's discrete prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSignal {
    pub agent_id: String,
    pub prediction: f64,
    pub confidence: f64,
    pub weight: f64,
    pub reliability_score: f64,
}

impl AgentSignal {
    /// Create a signal with unit weight and neutral (0.5) reliability.
    pub fn new(
        agent_id: impl Into<String>,
        prediction: f64,
        confidence: f64,
    ) -> Result<Self, TieBreakError> {
        let agent_id = agent_id.into();
        if !(0.0..=1.0).contains(&confidence) {
            return Err(TieBreakError::ConfidenceOutOfRange {
                agent_id,
                value: confidence,
            });
        }
        Ok(Self {
            agent_id,
            prediction,
            confidence,
            weight: 1.0,
            reliability_score: 0.5,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Result<Self, TieBreakError> {
        if !(0.0..=1.0).contains(&reliability) {
            return Err(TieBreakError::ReliabilityOutOfRange {
                agent_id: self.agent_id,
                value: reliability,
            });
        }
        self.reliability_score = reliability;
        Ok(self)
    }
}

/// How the resolution was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakMethod {
    SingleAgent,
    PrioritizedWeightDensity,
}

/// Which ranking key separated the winner from the runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    Unanimous,
    WeightDensity,
    MaxReliability,
    PredictionValueSmallest,
}

/// Aggregate metrics for one prediction group (rounded for reporting).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub prediction: f64,
    pub agents: Vec<String>,
    pub count: usize,
    pub weight_density: f64,
    pub avg_confidence: f64,
    pub max_reliability: f64,
}

/// Metadata about a tie-break resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieBreakDiagnostics {
    pub method: TieBreakMethod,
    /// Groups ordered by prediction value
    pub groups: Vec<GroupSummary>,
    pub selected_group: f64,
    pub tie_resolved_by: ResolvedBy,
    /// Population variance of confidence across all agents
    pub confidence_variance: f64,
}

impl TieBreakDiagnostics {
    /// Summary of the group holding `prediction`, if any.
    pub fn group(&self, prediction: f64) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.prediction == prediction)
    }
}

/// Unrounded group metrics used for ranking.
struct GroupMetrics<'a> {
    prediction: f64,
    members: Vec<&'a AgentSignal>,
    weight_density: f64,
    max_reliability: f64,
}

impl GroupMetrics<'_> {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .weight_density
            .total_cmp(&self.weight_density)
            .then_with(|| other.max_reliability.total_cmp(&self.max_reliability))
            .then_with(|| self.prediction.total_cmp(&other.prediction))
    }

    fn summarize(&self) -> GroupSummary {
        let count = self.members.len();
        let avg_confidence = self.members.iter().map(|a| a.confidence).sum::<f64>() / count as f64;
        GroupSummary {
            prediction: self.prediction,
            agents: self.members.iter().map(|a| a.agent_id.clone()).collect(),
            count,
            weight_density: round_to(self.weight_density, 4),
            avg_confidence: round_to(avg_confidence, 4),
            max_reliability: round_to(self.max_reliability, 4),
        }
    }
}

/// Resolves conflicts when agents predict different outcomes.
#[derive(Debug, Clone)]
pub struct DeterministicTieBreaker {
    /// Decimal places used when grouping predictions
    precision: u32,
}

impl DeterministicTieBreaker {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }

    /// Pick the winning prediction and explain the choice.
    pub fn resolve(
        &self,
        agents: &[AgentSignal],
    ) -> Result<(f64, TieBreakDiagnostics), TieBreakError> {
        let groups = self.group(agents);
        let first = groups.first().ok_or(TieBreakError::EmptyAgents)?;

        if agents.len() == 1 {
            let prediction = agents[0].prediction;
            return Ok((
                prediction,
                TieBreakDiagnostics {
                    method: TieBreakMethod::SingleAgent,
                    groups: vec![GroupSummary {
                        prediction,
                        ..first.summarize()
                    }],
                    selected_group: prediction,
                    tie_resolved_by: ResolvedBy::Unanimous,
                    confidence_variance: 0.0,
                },
            ));
        }

        let summaries = groups.iter().map(GroupMetrics::summarize).collect();

        let mut ranked: Vec<&GroupMetrics<'_>> = groups.iter().collect();
        ranked.sort_by(|a, b| a.rank(b));

        let winner = ranked[0];
        let tie_resolved_by = match ranked.get(1) {
            None => ResolvedBy::Unanimous,
            Some(second) if winner.weight_density != second.weight_density => {
                ResolvedBy::WeightDensity
            }
            Some(second) if winner.max_reliability != second.max_reliability => {
                ResolvedBy::MaxReliability
            }
            Some(_) => ResolvedBy::PredictionValueSmallest,
        };

        let n = agents.len() as f64;
        let mean = agents.iter().map(|a| a.confidence).sum::<f64>() / n;
        let variance = agents
            .iter()
            .map(|a| (a.confidence - mean).powi(2))
            .sum::<f64>()
            / n;

        tracing::debug!(
            groups = groups.len(),
            selected = winner.prediction,
            resolved_by = ?tie_resolved_by,
            "Tie-break resolved"
        );

        Ok((
            winner.prediction,
            TieBreakDiagnostics {
                method: TieBreakMethod::PrioritizedWeightDensity,
                groups: summaries,
                selected_group: winner.prediction,
                tie_resolved_by,
                confidence_variance: round_to(variance, 6),
            },
        ))
    }

    /// Group agents by rounded prediction, ordered by prediction value.
    fn group<'a>(&self, agents: &'a [AgentSignal]) -> Vec<GroupMetrics<'a>> {
        let scale = 10f64.powi(self.precision as i32);
        let mut buckets: BTreeMap<i64, Vec<&'a AgentSignal>> = BTreeMap::new();
        for agent in agents {
            let key = (agent.prediction * scale).round() as i64;
            buckets.entry(key).or_default().push(agent);
        }

        buckets
            .into_iter()
            .map(|(key, members)| {
                let total_weight: f64 = members.iter().map(|a| a.weight).sum();
                let max_reliability = members
                    .iter()
                    .map(|a| a.reliability_score)
                    .fold(f64::NEG_INFINITY, f64::max);
                GroupMetrics {
                    prediction: key as f64 / scale,
                    weight_density: total_weight / members.len() as f64,
                    max_reliability,
                    members,
                }
            })
            .collect()
    }
}

impl Default for DeterministicTieBreaker {
    fn default() -> Self {
        Self::new(6)
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
