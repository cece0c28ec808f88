//! Data model shared by the validator, the engine and the reliability store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One source's probability estimate for a market outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Identifier of the contributing source
    pub source_id: String,

    /// Probability of the outcome, in [0, 1]
    pub probability: f64,
}

impl Signal {
    pub fn new(source_id: impl Into<String>, probability: f64) -> Self {
        Self {
            source_id: source_id.into(),
            probability,
        }
    }
}

/// Reliability state tracked per source.
///
/// When returned by a store read, `reliability` is the effective value
/// decayed to the read time while `last_updated` is the time of the last
/// persisted update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityRecord {
    pub source_id: String,

    /// Reliability score in [min, max] of the configured bounds
    pub reliability: f64,

    /// When the stored value was last written by an update
    pub last_updated: DateTime<Utc>,

    /// Number of outcome observations folded into this record
    pub observation_count: u64,
}

impl ReliabilityRecord {
    /// A fresh record for a source seen for the first time.
    pub fn fresh(source_id: impl Into<String>, prior: f64, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            reliability: prior,
            last_updated: now,
            observation_count: 0,
        }
    }
}

/// The combined consensus for one market.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub schema_version: String,

    pub market_id: String,

    /// Posterior probability from the logarithmic opinion pool
    pub posterior_probability: f64,

    /// Normalized share of the pool held by each source (sums to 1)
    pub per_source_weight: BTreeMap<String, f64>,
}

impl ConsensusResult {
    /// Render the result as the versioned output document.
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "schemaVersion": self.schema_version,
            "marketId": self.market_id,
            "posteriorProbability": self.posterior_probability,
            "perSourceWeight": self.per_source_weight,
        })
    }
}
