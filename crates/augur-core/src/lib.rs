//! # augur-core
//!
//! Deterministic reliability-weighted consensus engine.
//!
//! This crate answers one question: given several sources' probability
//! estimates for the same market, and how much each source has earned our
//! trust, what is the combined estimate?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same input always produces the same output, bit for bit
//! 2. **Order-independent**: Signal order never changes the posterior
//! 3. **No I/O**: Reliability is supplied as snapshots; persistence lives in `augur-runtime`
//! 4. **Fail loudly**: Empty or all-zero-weight markets are errors, never defaults
//!
//! ## Example
//!
//! ```rust,ignore
//! use augur_core::{validate, ConsensusEngine, SCHEMA_VERSION};
//!
//! let market = validate(&document, SCHEMA_VERSION)?;
//! let inputs: Vec<_> = market
//!     .signals
//!     .iter()
//!     .map(|s| (s.clone(), store.get(&s.source_id, now)?))
//!     .collect::<Result<_, _>>()?;
//!
//! let result = ConsensusEngine::default().combine(&market.market_id, &inputs)?;
//! println!("posterior = {}", result.posterior_probability);
//! ```

pub mod contract;
pub mod engine;
pub mod reliability;
pub mod tiebreak;
pub mod types;

// Re-export main types at crate root
pub use contract::{
    validate, validate_input_schema, validate_output, OutputError, SchemaValidator,
    ValidatedMarket, ValidationError, SCHEMA_VERSION,
};
pub use engine::{logistic, logit, ConsensusEngine, ConsensusError, EngineParams, DEFAULT_EPSILON};
pub use reliability::{AccuracyMetric, ParamsError, ReliabilityParams};
pub use tiebreak::{
    AgentSignal, DeterministicTieBreaker, GroupSummary, ResolvedBy, TieBreakDiagnostics,
    TieBreakError, TieBreakMethod,
};
pub use types::{ConsensusResult, ReliabilityRecord, Signal};
