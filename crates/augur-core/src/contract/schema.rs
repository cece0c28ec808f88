//! JSON Schema documents for the published contract.
//!
//! Both schemas are embedded at compile time from `schemas/` and compiled
//! once. The output check adds the one rule JSON Schema cannot express:
//! `perSourceWeight` values must sum to 1.

use std::sync::OnceLock;
use thiserror::Error;

const OUTPUT_SCHEMA_JSON: &str = include_str!("../../../../schemas/consensus-output.schema.json");
const INPUT_SCHEMA_JSON: &str = include_str!("../../../../schemas/market-input.schema.json");

/// Allowed drift of the weight sum away from 1.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

static OUTPUT_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();
static INPUT_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from output document validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutputError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),

    #[error("Output violates schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("perSourceWeight must sum to 1 (got {sum})")]
    WeightSum { sum: f64 },
}

fn compiled(
    cell: &'static OnceLock<Result<jsonschema::Validator, String>>,
    source: &str,
) -> Result<&'static jsonschema::Validator, OutputError> {
    let result = cell.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(source) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(OutputError::LoadError(e.clone())),
    }
}

fn collect_errors(
    validator: &jsonschema::Validator,
    document: &serde_json::Value,
) -> Vec<String> {
    validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect()
}

/// Validate a consensus output document.
pub fn validate_output(document: &serde_json::Value) -> Result<(), OutputError> {
    let validator = compiled(&OUTPUT_SCHEMA, OUTPUT_SCHEMA_JSON)?;

    let errors = collect_errors(validator, document);
    if !errors.is_empty() {
        return Err(OutputError::SchemaViolation(errors));
    }

    let sum: f64 = document["perSourceWeight"]
        .as_object()
        .map(|weights| weights.values().filter_map(|v| v.as_f64()).sum())
        .unwrap_or(0.0);

    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(OutputError::WeightSum { sum });
    }

    Ok(())
}

/// Check an input document against the published input schema.
///
/// This reports every violation at once, which suits tooling that lints
/// fixtures. Request handling goes through [`super::validate`], which stops
/// at the first violation and names it.
pub fn validate_input_schema(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = compiled(&INPUT_SCHEMA, INPUT_SCHEMA_JSON).map_err(|e| vec![e.to_string()])?;

    let errors = collect_errors(validator, document);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
