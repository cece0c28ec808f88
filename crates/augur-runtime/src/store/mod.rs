//! Persistent reliability tracking.
//!
//! A store owns every [`ReliabilityRecord`] and is the only place a stored
//! reliability value is read or written. Each operation on a source id runs
//! as one transaction under that id's lock, so a concurrent reader never sees
//! the intermediate decayed-but-not-updated state. Operations on different
//! ids proceed independently.

mod memory;
mod sqlite;

pub use memory::InMemoryReliabilityStore;
pub use sqlite::SqliteReliabilityStore;

use augur_core::{ParamsError, ReliabilityParams, ReliabilityRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors from reliability store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store contention on source {source_id}: lock not acquired within {}", humantime::format_duration(*.waited))]
    StoreContention { source_id: String, waited: Duration },

    #[error("Invalid source identifier: {source_id:?}")]
    InvalidIdentifier { source_id: String },

    #[error("Accuracy indicator for {source_id} must be in [0,1] (got {value})")]
    AccuracyOutOfRange { source_id: String, value: f64 },

    #[error("Corrupt record for {source_id}: {reason}")]
    CorruptRecord { source_id: String, reason: String },

    #[error("Invalid store parameters: {0}")]
    InvalidParams(#[from] ParamsError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Contention is transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StoreContention { .. })
    }
}

/// Durable mapping from source id to reliability state.
pub trait ReliabilityStore: Send + Sync {
    /// Parameters used for decay and feedback.
    fn params(&self) -> &ReliabilityParams;

    /// Reliability of `source_id` as of `now`.
    ///
    /// Creates and persists a record at the prior if the source is unseen.
    /// The returned reliability is decayed to `now`; the stored value and
    /// `last_updated` are left untouched.
    fn get(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError>;

    /// Like [`get`](Self::get), but never persists a missing record.
    fn peek(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError>;

    /// Decay to `now`, then fold in `accuracy`. Atomic per source id.
    fn update(
        &self,
        source_id: &str,
        accuracy: f64,
        now: DateTime<Utc>,
    ) -> Result<ReliabilityRecord, StoreError>;
}

/// Reject empty or whitespace-only source ids.
pub fn check_identifier(source_id: &str) -> Result<(), StoreError> {
    if source_id.trim().is_empty() {
        return Err(StoreError::InvalidIdentifier {
            source_id: source_id.to_string(),
        });
    }
    Ok(())
}

/// Reject accuracy indicators outside [0, 1].
pub fn check_accuracy(source_id: &str, accuracy: f64) -> Result<(), StoreError> {
    if !(0.0..=1.0).contains(&accuracy) {
        return Err(StoreError::AccuracyOutOfRange {
            source_id: source_id.to_string(),
            value: accuracy,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behavior every backend must share.

    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    pub fn unseen_source_starts_at_prior(store: &dyn ReliabilityStore) {
        let record = store.get("fresh", t0()).unwrap();
        assert_eq!(record.reliability, store.params().prior);
        assert_eq!(record.observation_count, 0);
        assert_eq!(record.last_updated, t0());
    }

    pub fn get_persists_new_record(store: &dyn ReliabilityStore) {
        store.get("lazy", t0()).unwrap();
        // Later read sees the record created at t0, not a new one.
        let later = store.get("lazy", t0() + ChronoDuration::days(5)).unwrap();
        assert_eq!(later.last_updated, t0());
    }

    pub fn peek_does_not_persist(store: &dyn ReliabilityStore) {
        let first = store.peek("ghost", t0()).unwrap();
        assert_eq!(first.reliability, store.params().prior);

        let later = t0() + ChronoDuration::days(1);
        let second = store.peek("ghost", later).unwrap();
        assert_eq!(second.last_updated, later);
    }

    pub fn update_blends_and_counts(store: &dyn ReliabilityStore) {
        let alpha = store.params().learning_rate;
        let prior = store.params().prior;

        let first = store.update("agent-a", 1.0, t0()).unwrap();
        assert!((first.reliability - (prior * (1.0 - alpha) + alpha)).abs() < 1e-12);
        assert_eq!(first.observation_count, 1);
        assert_eq!(first.last_updated, t0());

        let second = store.update("agent-a", 1.0, t0()).unwrap();
        assert!(second.reliability > first.reliability);
        assert_eq!(second.observation_count, 2);

        let read = store.get("agent-a", t0()).unwrap();
        assert_eq!(read, second);
    }

    pub fn read_decays_without_mutating(store: &dyn ReliabilityStore) {
        for _ in 0..20 {
            store.update("stale", 1.0, t0()).unwrap();
        }
        let stored = store.get("stale", t0()).unwrap();

        let later = t0() + ChronoDuration::days(60);
        let decayed = store.get("stale", later).unwrap();
        assert!(decayed.reliability < stored.reliability);
        assert!(decayed.reliability > store.params().prior);
        assert_eq!(decayed.last_updated, t0());
        assert_eq!(decayed.observation_count, 20);

        // Reading again at t0 still returns the undecayed stored value.
        assert_eq!(store.get("stale", t0()).unwrap(), stored);
    }

    pub fn update_decays_before_blending(store: &dyn ReliabilityStore) {
        for _ in 0..10 {
            store.update("drifting", 1.0, t0()).unwrap();
        }
        let later = t0() + ChronoDuration::days(45);
        let expected_decayed = store.get("drifting", later).unwrap().reliability;

        let updated = store.update("drifting", expected_decayed, later).unwrap();
        assert!((updated.reliability - expected_decayed).abs() < 1e-12);
        assert_eq!(updated.last_updated, later);
        assert_eq!(updated.observation_count, 11);
    }

    pub fn rejects_bad_input(store: &dyn ReliabilityStore) {
        assert!(matches!(
            store.get("", t0()),
            Err(StoreError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            store.update("   ", 0.5, t0()),
            Err(StoreError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            store.peek("", t0()),
            Err(StoreError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            store.update("agent-a", 1.5, t0()),
            Err(StoreError::AccuracyOutOfRange { .. })
        ));
        assert!(matches!(
            store.update("agent-a", f64::NAN, t0()),
            Err(StoreError::AccuracyOutOfRange { .. })
        ));
    }

    pub fn run_all(store: &dyn ReliabilityStore) {
        unseen_source_starts_at_prior(store);
        get_persists_new_record(store);
        peek_does_not_persist(store);
        update_blends_and_counts(store);
        read_decays_without_mutating(store);
        update_decays_before_blending(store);
        rejects_bad_input(store);
    }
}
