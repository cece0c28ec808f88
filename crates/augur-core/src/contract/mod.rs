//! Versioned input/output contract.
//!
//! Input documents are checked against an explicit field table, in a fixed
//! order, so every rejection names one field. Output documents are checked
//! against the embedded JSON Schema.

mod schema;
mod validator;

pub use schema::{validate_input_schema, validate_output, OutputError, WEIGHT_SUM_TOLERANCE};
pub use validator::{validate, SchemaValidator, ValidatedMarket, ValidationError, SCHEMA_VERSION};
