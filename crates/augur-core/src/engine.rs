//! Consensus engine: weighted logarithmic opinion pool.
//!
//! For each signal:
//!   weight_i = reliability_i ^ k
//!   logit_i  = ln(p_i / (1 - p_i)),  p_i clamped to [eps, 1 - eps]
//! Then:
//!   posterior = logistic( sum(weight_i * logit_i) / sum(weight_i) )
//!   share_i   = weight_i / sum(weight_i)
//!
//! Terms are folded in a canonical order (source id, then probability, then
//! weight) so the result is bit-identical for any permutation of the input.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::contract::SCHEMA_VERSION;
use crate::reliability::ParamsError;
use crate::types::{ConsensusResult, ReliabilityRecord, Signal};

/// Default probability clamp applied before the logit transform.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Errors that make a market impossible to aggregate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("No signals to combine for market {market_id}")]
    NoSignals { market_id: String },

    #[error("Degenerate consensus for market {market_id}: every source has zero weight ({})", .sources.join(", "))]
    DegenerateConsensus {
        market_id: String,
        sources: Vec<String>,
    },
}

/// Engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    /// Probabilities are clamped to [epsilon, 1 - epsilon]
    pub epsilon: f64,

    /// Exponent k in `weight = reliability^k`
    pub weight_exponent: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            weight_exponent: 1.0,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(self.epsilon > 0.0 && self.epsilon < 0.5) {
            return Err(ParamsError::OutOfRange {
                name: "epsilon",
                value: self.epsilon,
                constraint: "must be in (0, 0.5)",
            });
        }
        if !(self.weight_exponent > 0.0 && self.weight_exponent.is_finite()) {
            return Err(ParamsError::OutOfRange {
                name: "weight_exponent",
                value: self.weight_exponent,
                constraint: "must be finite and > 0",
            });
        }
        Ok(())
    }

    /// Weights scaled so the most reliable source weighs exactly 1.
    ///
    /// Pooling is invariant to a common scale factor, and scaling first keeps
    /// `reliability^k` from underflowing to zero for large `k`. Every weight is
    /// zero only when every reliability is zero (or negative).
    pub fn relative_weights(&self, reliabilities: &[f64]) -> Vec<f64> {
        let peak = reliabilities
            .iter()
            .map(|r| r.max(0.0))
            .fold(0.0, f64::max);
        if peak <= 0.0 {
            return vec![0.0; reliabilities.len()];
        }
        reliabilities
            .iter()
            .map(|r| (r.max(0.0) / peak).powf(self.weight_exponent))
            .collect()
    }

    pub fn clamp(&self, probability: f64) -> f64 {
        probability.clamp(self.epsilon, 1.0 - self.epsilon)
    }
}

/// Log-odds of `p`.
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Inverse of [`logit`], stable for large magnitudes.
pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// One signal prepared for pooling.
struct Term<'a> {
    source_id: &'a str,
    probability: f64,
    weight: f64,
}

fn canonical_order(a: &Term<'_>, b: &Term<'_>) -> Ordering {
    a.source_id
        .cmp(b.source_id)
        .then_with(|| a.probability.total_cmp(&b.probability))
        .then_with(|| a.weight.total_cmp(&b.weight))
}

/// Combines reliability-weighted signals into a posterior.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    params: EngineParams,
    schema_version: String,
}

impl ConsensusEngine {
    /// Build an engine, rejecting parameters that would make pooling panic
    /// or misbehave (for example `epsilon >= 0.5`).
    pub fn new(params: EngineParams) -> Result<Self, ParamsError> {
        params.validate()?;
        Ok(Self {
            params,
            schema_version: SCHEMA_VERSION.to_string(),
        })
    }

    /// Stamp results with a different contract version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Combine signals paired with point-in-time reliability snapshots.
    ///
    /// # Errors
    ///
    /// * `NoSignals` - `inputs` is empty
    /// * `DegenerateConsensus` - every weight is zero
    pub fn combine(
        &self,
        market_id: &str,
        inputs: &[(Signal, ReliabilityRecord)],
    ) -> Result<ConsensusResult, ConsensusError> {
        if inputs.is_empty() {
            return Err(ConsensusError::NoSignals {
                market_id: market_id.to_string(),
            });
        }

        let reliabilities: Vec<f64> = inputs.iter().map(|(_, r)| r.reliability).collect();
        let weights = self.params.relative_weights(&reliabilities);

        let mut terms: Vec<Term<'_>> = inputs
            .iter()
            .zip(weights)
            .map(|((signal, _), weight)| Term {
                source_id: &signal.source_id,
                probability: self.params.clamp(signal.probability),
                weight,
            })
            .collect();
        terms.sort_by(canonical_order);

        let total_weight: f64 = terms.iter().map(|t| t.weight).sum();
        if total_weight <= 0.0 {
            return Err(ConsensusError::DegenerateConsensus {
                market_id: market_id.to_string(),
                sources: terms.iter().map(|t| t.source_id.to_string()).collect(),
            });
        }

        let mut weighted = terms.iter().filter(|t| t.weight > 0.0);
        let posterior = match (weighted.next(), weighted.next()) {
            // A lone voice passes through untouched.
            (Some(only), None) => only.probability,
            _ => {
                let pooled_logit = terms
                    .iter()
                    .map(|t| t.weight * logit(t.probability))
                    .sum::<f64>()
                    / total_weight;
                logistic(pooled_logit)
            }
        };

        let mut per_source_weight = BTreeMap::new();
        for term in &terms {
            *per_source_weight
                .entry(term.source_id.to_string())
                .or_insert(0.0) += term.weight / total_weight;
        }

        tracing::debug!(
            market_id = %market_id,
            signals = terms.len(),
            total_weight,
            posterior,
            "Consensus combined"
        );

        Ok(ConsensusResult {
            schema_version: self.schema_version.clone(),
            market_id: market_id.to_string(),
            posterior_probability: posterior,
            per_source_weight,
        })
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self {
            params: EngineParams::default(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}
