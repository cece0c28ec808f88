//! In-process reliability store.

use super::{check_accuracy, check_identifier, ReliabilityStore, StoreError};
use crate::locks::KeyedMutex;
use augur_core::{ReliabilityParams, ReliabilityRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Reliability records held in memory for the life of the process.
///
/// Used for tests and for embedding where durability is not needed. The
/// per-source locking discipline is the same as the SQLite backend.
#[derive(Debug)]
pub struct InMemoryReliabilityStore {
    records: RwLock<HashMap<String, ReliabilityRecord>>,
    locks: KeyedMutex,
    params: ReliabilityParams,
    lock_timeout: Duration,
}

impl InMemoryReliabilityStore {
    /// Empty store. Rejects parameters that fail [`ReliabilityParams::validate`].
    pub fn new(params: ReliabilityParams, lock_timeout: Duration) -> Result<Self, StoreError> {
        params.validate()?;
        Ok(Self::with_valid_params(params, lock_timeout))
    }

    fn with_valid_params(params: ReliabilityParams, lock_timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: KeyedMutex::new(),
            params,
            lock_timeout,
        }
    }

    /// Number of sources with a stored record.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn read(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
        persist: bool,
    ) -> Result<ReliabilityRecord, StoreError> {
        check_identifier(source_id)?;
        let _guard = self.lock(source_id)?;

        let existing = self.records.read().get(source_id).cloned();
        let record = match existing {
            Some(record) => record,
            None => {
                let fresh = ReliabilityRecord::fresh(source_id, self.params.prior, now);
                if persist {
                    tracing::debug!(source_id = %source_id, prior = fresh.reliability, "Created reliability record");
                    self.records
                        .write()
                        .insert(source_id.to_string(), fresh.clone());
                }
                fresh
            }
        };

        Ok(self.params.snapshot(&record, now))
    }

    fn lock(&self, source_id: &str) -> Result<crate::locks::KeyGuard<'_>, StoreError> {
        self.locks
            .acquire(source_id, self.lock_timeout)
            .ok_or_else(|| StoreError::StoreContention {
                source_id: source_id.to_string(),
                waited: self.lock_timeout,
            })
    }
}

impl Default for InMemoryReliabilityStore {
    fn default() -> Self {
        Self::with_valid_params(ReliabilityParams::default(), Duration::from_secs(2))
    }
}

impl ReliabilityStore for InMemoryReliabilityStore {
    fn params(&self) -> &ReliabilityParams {
        &self.params
    }

    fn get(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError> {
        self.read(source_id, now, true)
    }

    fn peek(&self, source_id: &str, now: DateTime<Utc>) -> Result<ReliabilityRecord, StoreError> {
        self.read(source_id, now, false)
    }

    fn update(
        &self,
        source_id: &str,
        accuracy: f64,
        now: DateTime<Utc>,
    ) -> Result<ReliabilityRecord, StoreError> {
        check_identifier(source_id)?;
        check_accuracy(source_id, accuracy)?;
        let _guard = self.lock(source_id)?;

        let current = self
            .records
            .read()
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| ReliabilityRecord::fresh(source_id, self.params.prior, now));

        let updated = self.params.apply_feedback(&current, accuracy, now);
        self.records
            .write()
            .insert(source_id.to_string(), updated.clone());

        tracing::debug!(
            source_id = %source_id,
            accuracy,
            reliability = updated.reliability,
            observations = updated.observation_count,
            "Reliability updated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract_tests::{self, t0};
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_contract() {
        contract_tests::run_all(&InMemoryReliabilityStore::default());
    }

    #[test]
    fn test_peek_leaves_store_empty() {
        let store = InMemoryReliabilityStore::default();
        store.peek("agent-a", t0()).unwrap();
        assert!(store.is_empty());

        store.get("agent-a", t0()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_held_key_reports_contention() {
        let store = Arc::new(
            InMemoryReliabilityStore::new(ReliabilityParams::default(), Duration::from_millis(20))
                .unwrap(),
        );
        let _held = store.locks.acquire("agent-a", Duration::from_millis(10)).unwrap();

        let contender = Arc::clone(&store);
        let result = thread::spawn(move || contender.update("agent-a", 1.0, t0()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(StoreError::StoreContention { .. })));

        // Other sources are unaffected.
        assert!(store.update("agent-b", 1.0, t0()).is_ok());
    }

    #[test]
    fn test_bounds_respected() {
        let params = ReliabilityParams {
            min_reliability: 0.2,
            max_reliability: 0.8,
            learning_rate: 0.9,
            ..ReliabilityParams::default()
        };
        let store = InMemoryReliabilityStore::new(params, Duration::from_secs(1)).unwrap();
        for _ in 0..5 {
            store.update("high", 1.0, t0()).unwrap();
            store.update("low", 0.0, t0()).unwrap();
        }
        assert_eq!(store.get("high", t0()).unwrap().reliability, 0.8);
        assert_eq!(store.get("low", t0()).unwrap().reliability, 0.2);
    }

    #[test]
    fn test_inverted_bounds_rejected_at_construction() {
        let params = ReliabilityParams {
            min_reliability: 0.8,
            max_reliability: 0.2,
            ..ReliabilityParams::default()
        };
        let err = InMemoryReliabilityStore::new(params, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidParams(_)));
        assert!(!err.is_retryable());
    }

    proptest! {
        #[test]
        fn prop_updates_stay_in_bounds_and_count(
            steps in prop::collection::vec((0.0f64..=1.0, 0i64..90), 1..40),
        ) {
            let store = InMemoryReliabilityStore::default();
            let mut at = t0();
            for (accuracy, gap_days) in &steps {
                at += ChronoDuration::days(*gap_days);
                let record = store.update("agent-a", *accuracy, at).unwrap();
                prop_assert!((0.0..=1.0).contains(&record.reliability));
                prop_assert_eq!(record.last_updated, at);
            }
            let read = store.get("agent-a", at).unwrap();
            prop_assert_eq!(read.observation_count, steps.len() as u64);
        }
    }
}
