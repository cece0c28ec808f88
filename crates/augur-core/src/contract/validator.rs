//! Input contract validation.
//!
//! The contract is an explicit field table: every field names its JSON type
//! and whether it may be absent or empty. Checks run in a fixed order and the
//! first violation is reported:
//!
//! 1. `schemaVersion` present and equal to the expected version
//! 2. no top-level fields beyond the documented set
//! 3. required fields present with correct types (market, then each signal)
//! 4. every `probability` within [0, 1]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::Signal;

/// Contract version this build reads and writes.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Errors raised while validating an input document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{}", describe_version_mismatch(.expected, .found.as_deref()))]
    SchemaVersionMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error("Unknown field: {field}")]
    UnknownField { field: String },

    #[error("{field} is required")]
    MissingField { field: String },

    #[error("{field} must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },

    #[error("{field} must be a non-empty string")]
    EmptyField { field: String },

    #[error("{field} must be between 0 and 1 (got {value})")]
    ProbabilityRange { field: String, value: f64 },

    #[error("Malformed JSON: {0}")]
    MalformedJson(String),
}

fn describe_version_mismatch(expected: &str, found: Option<&str>) -> String {
    match found {
        None => "schemaVersion is required".to_string(),
        Some(found) => format!("schemaVersion must be '{}' (got '{}')", expected, found),
    }
}

/// JSON type a field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    String,
    Number,
    Array,
}

impl FieldKind {
    fn describe(self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Array => "an array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Array => value.is_array(),
        }
    }
}

/// One row of the contract's field table.
#[derive(Debug, Clone, Copy)]
struct FieldRule {
    name: &'static str,
    kind: FieldKind,
    /// Strings must contain a non-whitespace character
    non_empty: bool,
}

const MARKET_FIELDS: [FieldRule; 3] = [
    FieldRule {
        name: "schemaVersion",
        kind: FieldKind::String,
        non_empty: true,
    },
    FieldRule {
        name: "marketId",
        kind: FieldKind::String,
        non_empty: true,
    },
    FieldRule {
        name: "signals",
        kind: FieldKind::Array,
        non_empty: false,
    },
];

const SIGNAL_FIELDS: [FieldRule; 2] = [
    FieldRule {
        name: "sourceId",
        kind: FieldKind::String,
        non_empty: true,
    },
    FieldRule {
        name: "probability",
        kind: FieldKind::Number,
        non_empty: false,
    },
];

/// A market document that passed validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedMarket {
    pub schema_version: String,
    pub market_id: String,
    /// Signals in document order
    pub signals: Vec<Signal>,
}

impl ValidatedMarket {
    /// Parse and validate a JSON string.
    pub fn from_json(json: &str, expected_version: &str) -> Result<Self, ValidationError> {
        let document: Value = serde_json::from_str(json)
            .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
        validate(&document, expected_version)
    }

    /// Re-serialize into the input document shape.
    pub fn to_document(&self) -> Value {
        let signals: Vec<Value> = self
            .signals
            .iter()
            .map(|s| {
                serde_json::json!({
                    "sourceId": s.source_id,
                    "probability": s.probability,
                })
            })
            .collect();

        serde_json::json!({
            "schemaVersion": self.schema_version,
            "marketId": self.market_id,
            "signals": signals,
        })
    }
}

/// Validator bound to one contract version.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    expected_version: String,
}

impl SchemaValidator {
    pub fn new(expected_version: impl Into<String>) -> Self {
        Self {
            expected_version: expected_version.into(),
        }
    }

    pub fn expected_version(&self) -> &str {
        &self.expected_version
    }

    /// Validate an input document against this validator's version.
    pub fn validate(&self, document: &Value) -> Result<ValidatedMarket, ValidationError> {
        validate(document, &self.expected_version)
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(SCHEMA_VERSION)
    }
}

/// Validate an input document. All-or-nothing: the first violation is returned.
pub fn validate(document: &Value, expected_version: &str) -> Result<ValidatedMarket, ValidationError> {
    let root = document.as_object().ok_or_else(|| ValidationError::InvalidType {
        field: "document".to_string(),
        expected: "an object",
    })?;

    // (a) version tag
    let found = root.get("schemaVersion");
    match found.and_then(Value::as_str) {
        Some(version) if version == expected_version => {}
        _ => {
            return Err(ValidationError::SchemaVersionMismatch {
                expected: expected_version.to_string(),
                found: found.map(render_found),
            })
        }
    }

    // (b) closed top-level field set
    reject_unknown(root, &MARKET_FIELDS, "")?;

    // (c) presence and types
    let [_, market_id_rule, signals_rule] = &MARKET_FIELDS;
    let market_id = check_field(root, market_id_rule, "")?
        .as_str()
        .unwrap_or_default()
        .to_string();
    let raw_signals = check_field(root, signals_rule, "")?
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut signals = Vec::with_capacity(raw_signals.len());
    for (idx, raw) in raw_signals.iter().enumerate() {
        let prefix = format!("signals[{}].", idx);
        let object = raw.as_object().ok_or_else(|| ValidationError::InvalidType {
            field: format!("signals[{}]", idx),
            expected: "an object",
        })?;
        reject_unknown(object, &SIGNAL_FIELDS, &prefix)?;

        let [source_id_rule, probability_rule] = &SIGNAL_FIELDS;
        let source_id = check_field(object, source_id_rule, &prefix)?;
        let probability = check_field(object, probability_rule, &prefix)?;
        signals.push(Signal::new(
            source_id.as_str().unwrap_or_default(),
            probability.as_f64().unwrap_or(f64::NAN),
        ));
    }

    // (d) ranges
    for (idx, signal) in signals.iter().enumerate() {
        if !(0.0..=1.0).contains(&signal.probability) {
            return Err(ValidationError::ProbabilityRange {
                field: format!("signals[{}].probability", idx),
                value: signal.probability,
            });
        }
    }

    tracing::debug!(
        market_id = %market_id,
        signals = signals.len(),
        "Market document validated"
    );

    Ok(ValidatedMarket {
        schema_version: expected_version.to_string(),
        market_id,
        signals,
    })
}

fn render_found(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn reject_unknown(
    object: &Map<String, Value>,
    table: &[FieldRule],
    prefix: &str,
) -> Result<(), ValidationError> {
    // Map iteration is key-sorted, so the reported field is deterministic.
    match object
        .keys()
        .find(|key| !table.iter().any(|rule| rule.name == key.as_str()))
    {
        Some(key) => Err(ValidationError::UnknownField {
            field: format!("{}{}", prefix, key),
        }),
        None => Ok(()),
    }
}

fn check_field<'a>(
    object: &'a Map<String, Value>,
    rule: &FieldRule,
    prefix: &str,
) -> Result<&'a Value, ValidationError> {
    let field = || format!("{}{}", prefix, rule.name);

    let value = object
        .get(rule.name)
        .ok_or_else(|| ValidationError::MissingField { field: field() })?;

    if !rule.kind.matches(value) {
        return Err(ValidationError::InvalidType {
            field: field(),
            expected: rule.kind.describe(),
        });
    }

    if rule.non_empty && value.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Err(ValidationError::EmptyField { field: field() });
    }

    Ok(value)
}
