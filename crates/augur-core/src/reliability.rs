//! Reliability decay and feedback rules (pure math, no storage).
//!
//! Stored reliability relaxes toward the prior as a source goes unused:
//!
//! `effective = prior + (stored - prior) * exp(-decay_rate * elapsed_secs)`
//!
//! Outcome feedback first decays to the feedback time, then blends in the
//! accuracy indicator with learning rate `alpha`:
//!
//! `next = clamp(decayed * (1 - alpha) + alpha * accuracy, min, max)`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ReliabilityRecord;

/// 30-day half-life expressed as a per-second rate.
pub const DEFAULT_DECAY_RATE: f64 = std::f64::consts::LN_2 / (30.0 * 86_400.0);

/// Errors from parameter validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    #[error("{name} out of range: {value} ({constraint})")]
    OutOfRange {
        name: &'static str,
        value: f64,
        constraint: &'static str,
    },
}

/// Tunable parameters of the reliability model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityParams {
    /// Neutral reliability assigned to unseen sources and decayed toward
    pub prior: f64,

    /// Decay rate per second (lambda)
    pub decay_rate: f64,

    /// Weight of a new observation (alpha)
    pub learning_rate: f64,

    pub min_reliability: f64,

    pub max_reliability: f64,
}

impl Default for ReliabilityParams {
    fn default() -> Self {
        Self {
            prior: 0.5,
            decay_rate: DEFAULT_DECAY_RATE,
            learning_rate: 0.1,
            min_reliability: 0.0,
            max_reliability: 1.0,
        }
    }
}

impl ReliabilityParams {
    /// Check every parameter against its admissible range.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let out_of_range = |name, value, constraint| {
            Err(ParamsError::OutOfRange {
                name,
                value,
                constraint,
            })
        };

        if !(self.decay_rate > 0.0 && self.decay_rate.is_finite()) {
            return out_of_range("decay_rate", self.decay_rate, "must be finite and > 0");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate < 1.0) {
            return out_of_range("learning_rate", self.learning_rate, "must be in (0, 1)");
        }
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return out_of_range("min_reliability", self.min_reliability, "must be in [0, 1]");
        }
        if !(self.min_reliability..=1.0).contains(&self.max_reliability) {
            return out_of_range(
                "max_reliability",
                self.max_reliability,
                "must be in [min_reliability, 1]",
            );
        }
        if !(self.min_reliability..=self.max_reliability).contains(&self.prior) {
            return out_of_range("prior", self.prior, "must be in [min_reliability, max_reliability]");
        }
        Ok(())
    }

    /// Decay a stored value over `elapsed_secs`. Negative elapsed time
    /// (clock skew) is treated as zero.
    pub fn decay(&self, stored: f64, elapsed_secs: f64) -> f64 {
        let elapsed = elapsed_secs.max(0.0);
        if elapsed == 0.0 {
            return stored;
        }
        self.prior + (stored - self.prior) * (-self.decay_rate * elapsed).exp()
    }

    /// Effective reliability of `record` as seen at `now`.
    pub fn effective(&self, record: &ReliabilityRecord, now: DateTime<Utc>) -> f64 {
        self.decay(record.reliability, elapsed_secs(record.last_updated, now))
    }

    /// Snapshot of `record` with reliability decayed to `now`.
    ///
    /// `last_updated` and `observation_count` are carried over unchanged:
    /// reading never advances the record.
    pub fn snapshot(&self, record: &ReliabilityRecord, now: DateTime<Utc>) -> ReliabilityRecord {
        ReliabilityRecord {
            reliability: self.effective(record, now),
            ..record.clone()
        }
    }

    /// Fold one outcome observation into `record`.
    ///
    /// The caller is responsible for range-checking `accuracy`.
    pub fn apply_feedback(
        &self,
        record: &ReliabilityRecord,
        accuracy: f64,
        now: DateTime<Utc>,
    ) -> ReliabilityRecord {
        let decayed = self.effective(record, now);
        let blended = decayed * (1.0 - self.learning_rate) + self.learning_rate * accuracy;

        ReliabilityRecord {
            source_id: record.source_id.clone(),
            reliability: blended.clamp(self.min_reliability, self.max_reliability),
            last_updated: now.max(record.last_updated),
            observation_count: record.observation_count + 1,
        }
    }
}

/// Seconds between two instants, with sub-second precision.
pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_seconds() as f64,
    }
}

/// How a source's signal is scored against the realized outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyMetric {
    /// `1 - |p - outcome|`
    #[default]
    AbsoluteError,

    /// `1 - (p - outcome)^2`
    Brier,
}

impl AccuracyMetric {
    /// Accuracy indicator in [0, 1] for a probability and outcome in [0, 1].
    pub fn score(self, probability: f64, outcome: f64) -> f64 {
        let error = (probability - outcome).abs();
        let score = match self {
            AccuracyMetric::AbsoluteError => 1.0 - error,
            AccuracyMetric::Brier => 1.0 - error * error,
        };
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(reliability: f64) -> ReliabilityRecord {
        ReliabilityRecord {
            source_id: "agent-a".to_string(),
            reliability,
            last_updated: t0(),
            observation_count: 3,
        }
    }

    #[test]
    fn test_default_params_are_valid() {
        assert!(ReliabilityParams::default().validate().is_ok());
    }

    #[test]
    fn test_default_half_life_is_thirty_days() {
        let params = ReliabilityParams::default();
        let decayed = params.decay(1.0, 30.0 * 86_400.0);
        assert!((decayed - 0.75).abs() < 1e-9, "got {}", decayed);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let cases = [
            ReliabilityParams { decay_rate: 0.0, ..Default::default() },
            ReliabilityParams { decay_rate: f64::INFINITY, ..Default::default() },
            ReliabilityParams { learning_rate: 0.0, ..Default::default() },
            ReliabilityParams { learning_rate: 1.0, ..Default::default() },
            ReliabilityParams { min_reliability: -0.1, ..Default::default() },
            ReliabilityParams { max_reliability: 1.2, ..Default::default() },
            ReliabilityParams { min_reliability: 0.6, ..Default::default() },
            ReliabilityParams { prior: 0.95, max_reliability: 0.9, ..Default::default() },
        ];
        for params in &cases {
            assert!(params.validate().is_err(), "accepted {:?}", params);
        }
    }

    #[test]
    fn test_zero_elapsed_is_identity() {
        let params = ReliabilityParams::default();
        assert_eq!(params.decay(0.9, 0.0), 0.9);
        assert_eq!(params.effective(&record(0.9), t0()), 0.9);
    }

    #[test]
    fn test_negative_elapsed_clamped() {
        let params = ReliabilityParams::default();
        let earlier = t0() - Duration::days(3);
        assert_eq!(params.effective(&record(0.9), earlier), 0.9);
    }

    #[test]
    fn test_decay_converges_to_prior() {
        let params = ReliabilityParams::default();
        let far = t0() + Duration::days(365 * 50);
        assert!((params.effective(&record(0.95), far) - 0.5).abs() < 1e-12);
        assert!((params.effective(&record(0.05), far) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_keeps_bookkeeping() {
        let params = ReliabilityParams::default();
        let later = t0() + Duration::days(10);
        let snap = params.snapshot(&record(0.9), later);

        assert!(snap.reliability < 0.9 && snap.reliability > 0.5);
        assert_eq!(snap.last_updated, t0());
        assert_eq!(snap.observation_count, 3);
    }

    #[test]
    fn test_feedback_blends_and_advances() {
        let params = ReliabilityParams::default();
        let next = params.apply_feedback(&record(0.5), 1.0, t0());

        assert!((next.reliability - 0.55).abs() < 1e-12);
        assert_eq!(next.observation_count, 4);
        assert_eq!(next.last_updated, t0());
    }

    #[test]
    fn test_feedback_decays_first() {
        let params = ReliabilityParams::default();
        let later = t0() + Duration::days(30);
        let next = params.apply_feedback(&record(1.0), 0.0, later);

        // decayed to 0.75, then 0.75 * 0.9
        assert!((next.reliability - 0.675).abs() < 1e-9);
        assert_eq!(next.last_updated, later);
    }

    #[test]
    fn test_feedback_respects_bounds() {
        let params = ReliabilityParams {
            min_reliability: 0.2,
            max_reliability: 0.8,
            ..Default::default()
        };
        let high = params.apply_feedback(&record(0.8), 1.0, t0());
        assert_eq!(high.reliability, 0.8);

        let low = params.apply_feedback(&record(0.2), 0.0, t0());
        assert_eq!(low.reliability, 0.2);
    }

    #[test]
    fn test_elapsed_secs_sub_second() {
        let later = t0() + Duration::milliseconds(1500);
        assert!((elapsed_secs(t0(), later) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_metrics() {
        assert!((AccuracyMetric::AbsoluteError.score(0.8, 1.0) - 0.8).abs() < 1e-12);
        assert!((AccuracyMetric::AbsoluteError.score(0.8, 0.0) - 0.2).abs() < 1e-12);
        assert!((AccuracyMetric::Brier.score(0.8, 1.0) - 0.96).abs() < 1e-12);
        assert!((AccuracyMetric::Brier.score(0.8, 0.0) - 0.36).abs() < 1e-12);
        assert_eq!(AccuracyMetric::default(), AccuracyMetric::AbsoluteError);
    }

    #[test]
    fn test_metric_deserializes_snake_case() {
        let metric: AccuracyMetric = serde_json::from_str("\"brier\"").unwrap();
        assert_eq!(metric, AccuracyMetric::Brier);
    }

    proptest! {
        #[test]
        fn prop_decay_moves_monotonically_toward_prior(
            stored in 0.0f64..=1.0,
            dt1 in 0.0f64..1.0e7,
            extra in 1.0f64..1.0e7,
        ) {
            prop_assume!((stored - 0.5).abs() > 1e-3);
            let params = ReliabilityParams::default();
            let near = params.decay(stored, dt1);
            let far = params.decay(stored, dt1 + extra);

            // Strictly closer to the prior, never crossing it.
            prop_assert!((far - 0.5).abs() < (near - 0.5).abs());
            prop_assert!((far - 0.5).signum() == (stored - 0.5).signum() || far == 0.5);
        }

        #[test]
        fn prop_feedback_at_decayed_value_is_fixed_point(
            stored in 0.0f64..=1.0,
            days in 0i64..400,
        ) {
            let params = ReliabilityParams::default();
            let mut rec = record(stored);
            rec.last_updated = t0();
            let now = t0() + Duration::days(days);

            let decayed = params.effective(&rec, now);
            let next = params.apply_feedback(&rec, decayed, now);
            prop_assert!((next.reliability - decayed).abs() < 1e-12);
        }

        #[test]
        fn prop_feedback_stays_in_bounds(
            stored in 0.0f64..=1.0,
            accuracy in 0.0f64..=1.0,
            days in 0i64..1000,
        ) {
            let params = ReliabilityParams::default();
            let next = params.apply_feedback(&record(stored), accuracy, t0() + Duration::days(days));
            prop_assert!((0.0..=1.0).contains(&next.reliability));
        }
    }
}
