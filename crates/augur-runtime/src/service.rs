//! Consensus service: validate, fetch reliability, combine, learn.
//!
//! The service owns no reliability state of its own. The store is injected
//! as an `Arc` so several services (or threads) can share one backend.

use crate::config::{ConfigError, RuntimeConfig};
use crate::retry::with_contention_retry;
use crate::store::{ReliabilityStore, StoreError};
use augur_core::{
    validate_output, ConsensusEngine, ConsensusError, ConsensusResult, OutputError,
    ReliabilityRecord, SchemaValidator, Signal, ValidatedMarket, ValidationError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by [`ConsensusService`].
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Consensus failed: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Output contract violated: {0}")]
    Output(#[from] OutputError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Outcome for market {market_id} must be in [0,1] (got {value})")]
    InvalidOutcome { market_id: String, value: f64 },

    /// Feedback stopped part way. `applied` was committed; retry with
    /// `remaining`, which starts at the signal that failed.
    #[error(
        "Feedback for market {market_id} stopped after {} of {} sources: {source}",
        .applied.len(),
        .applied.len() + .remaining.signals.len()
    )]
    PartialFeedback {
        market_id: String,
        applied: Vec<ReliabilityRecord>,
        remaining: ValidatedMarket,
        source: StoreError,
    },
}

impl ServiceError {
    /// Whether repeating the failed call (or `remaining`) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Store(err) | ServiceError::PartialFeedback { source: err, .. } => {
                err.is_retryable()
            }
            _ => false,
        }
    }
}

/// Per-source detail behind a consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDiagnostic {
    pub source_id: String,
    pub probability: f64,
    /// Reliability decayed to the evaluation time
    pub effective_reliability: f64,
    pub observation_count: u64,
    /// `(reliability / peak)^k`, where peak is the highest reliability in the market
    pub weight: f64,
    /// Fraction of the total weight
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusDiagnostics {
    /// One entry per signal, in document order
    pub sources: Vec<SourceDiagnostic>,
    pub dry_run: bool,
}

/// Consensus result plus how it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusReport {
    pub result: ConsensusResult,
    pub diagnostics: ConsensusDiagnostics,
}

/// Wires the validator, a reliability store and the engine together.
pub struct ConsensusService<S: ReliabilityStore + ?Sized> {
    store: Arc<S>,
    validator: SchemaValidator,
    engine: ConsensusEngine,
    config: RuntimeConfig,
}

impl<S: ReliabilityStore + ?Sized> ConsensusService<S> {
    pub fn new(store: Arc<S>, config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        store.params().validate()?;
        let engine = ConsensusEngine::new(config.engine)?;
        Ok(Self {
            store,
            validator: SchemaValidator::default(),
            engine,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Validate a market document and compute its consensus.
    ///
    /// Validation failures are reported before the store is touched.
    pub fn compute_consensus(
        &self,
        document: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ConsensusReport, ServiceError> {
        let market = self.validator.validate(document)?;
        self.combine_market(&market, now)
    }

    /// Compute the consensus of an already validated market.
    pub fn combine_market(
        &self,
        market: &ValidatedMarket,
        now: DateTime<Utc>,
    ) -> Result<ConsensusReport, ServiceError> {
        let mut inputs: Vec<(Signal, ReliabilityRecord)> = Vec::with_capacity(market.signals.len());
        for signal in &market.signals {
            let record = self.fetch(&signal.source_id, now)?;
            inputs.push((signal.clone(), record));
        }

        let result = self.engine.combine(&market.market_id, &inputs)?;
        validate_output(&result.to_document())?;

        let reliabilities: Vec<f64> = inputs.iter().map(|(_, r)| r.reliability).collect();
        let weights = self.engine.params().relative_weights(&reliabilities);
        let total_weight: f64 = weights.iter().sum();
        let sources = inputs
            .iter()
            .zip(weights)
            .map(|((signal, record), weight)| {
                SourceDiagnostic {
                    source_id: signal.source_id.clone(),
                    probability: signal.probability,
                    effective_reliability: record.reliability,
                    observation_count: record.observation_count,
                    weight,
                    share: weight / total_weight,
                }
            })
            .collect();

        tracing::debug!(
            market_id = %market.market_id,
            posterior = result.posterior_probability,
            dry_run = self.config.dry_run,
            "Consensus computed"
        );

        Ok(ConsensusReport {
            result,
            diagnostics: ConsensusDiagnostics {
                sources,
                dry_run: self.config.dry_run,
            },
        })
    }

    /// Score every signal of `market` against the realized `outcome` and
    /// update each source's reliability.
    ///
    /// In dry-run mode the updated records are projected and returned but
    /// nothing is written. Returns one record per signal, in document order.
    ///
    /// Each source is committed on its own. If a later source fails after
    /// earlier ones were written, the error is
    /// [`ServiceError::PartialFeedback`]; a failure before anything was
    /// written is a plain [`ServiceError::Store`].
    pub fn record_outcome(
        &self,
        market: &ValidatedMarket,
        outcome: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReliabilityRecord>, ServiceError> {
        if !(0.0..=1.0).contains(&outcome) {
            return Err(ServiceError::InvalidOutcome {
                market_id: market.market_id.clone(),
                value: outcome,
            });
        }

        let metric = self.config.accuracy_metric;
        let mut projected: HashMap<&str, ReliabilityRecord> = HashMap::new();
        let mut updated = Vec::with_capacity(market.signals.len());

        for (index, signal) in market.signals.iter().enumerate() {
            let accuracy = metric.score(signal.probability, outcome);
            let source_id = signal.source_id.as_str();

            let record = if self.config.dry_run {
                let current = match projected.get(source_id) {
                    Some(record) => record.clone(),
                    None => {
                        // Already decayed to `now`; pin it there so feedback does not decay twice.
                        let snapshot = self.fetch(source_id, now)?;
                        ReliabilityRecord {
                            last_updated: now,
                            ..snapshot
                        }
                    }
                };
                let next = self.store.params().apply_feedback(&current, accuracy, now);
                projected.insert(source_id, next.clone());
                next
            } else {
                let result = with_contention_retry(&self.config.retry, || {
                    self.store.update(source_id, accuracy, now)
                });
                match result {
                    Ok(record) => record,
                    Err(source) if updated.is_empty() => return Err(source.into()),
                    Err(source) => {
                        tracing::warn!(
                            market_id = %market.market_id,
                            source_id = %source_id,
                            applied = updated.len(),
                            error = %source,
                            "Feedback stopped part way"
                        );
                        return Err(ServiceError::PartialFeedback {
                            market_id: market.market_id.clone(),
                            applied: updated,
                            remaining: ValidatedMarket {
                                signals: market.signals[index..].to_vec(),
                                ..market.clone()
                            },
                            source,
                        });
                    }
                }
            };

            tracing::info!(
                market_id = %market.market_id,
                source_id = %source_id,
                accuracy,
                reliability = record.reliability,
                dry_run = self.config.dry_run,
                "Feedback applied"
            );
            updated.push(record);
        }

        Ok(updated)
    }

    fn fetch(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError> {
        with_contention_retry(&self.config.retry, || {
            if self.config.dry_run {
                self.store.peek(source_id, now)
            } else {
                self.store.get(source_id, now)
            }
        })
    }
}
