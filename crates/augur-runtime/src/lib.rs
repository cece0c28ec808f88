//! # augur-runtime
//!
//! Persistent reliability tracking and consensus orchestration for Augur.
//!
//! `augur-core` combines signals given reliability snapshots. This crate
//! owns where those snapshots come from: a [`ReliabilityStore`] that decays
//! scores toward the prior on read and folds in outcome feedback on update,
//! with every operation on a source id serialized under that id's lock.
//!
//! ## Backends
//!
//! - [`SqliteReliabilityStore`]: durable, one row per source
//! - [`InMemoryReliabilityStore`]: process-local, for tests and embedding
//!
//! ## Example
//!
//! ```rust,ignore
//! use augur_runtime::{open_store, ConsensusService, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_yaml_file("augur.yaml")?;
//! let service = ConsensusService::new(open_store(&config)?, config)?;
//!
//! let report = service.compute_consensus(&document, chrono::Utc::now())?;
//! println!("posterior = {}", report.result.posterior_probability);
//!
//! // Later, once the market resolves:
//! let market = augur_core::validate(&document, augur_core::SCHEMA_VERSION)?;
//! service.record_outcome(&market, 1.0, chrono::Utc::now())?;
//! ```
//!
//! The library emits `tracing` events but never installs a subscriber.

pub mod config;
pub mod locks;
pub mod retry;
pub mod service;
pub mod store;

pub use config::{ConfigError, RetryConfig, RuntimeConfig, StoreConfig};
pub use locks::{KeyGuard, KeyedMutex};
pub use retry::with_contention_retry;
pub use service::{
    ConsensusDiagnostics, ConsensusReport, ConsensusService, ServiceError, SourceDiagnostic,
};
pub use store::{
    InMemoryReliabilityStore, ReliabilityStore, SqliteReliabilityStore, StoreError,
};

use std::sync::Arc;

/// Open the store described by `config.store`.
///
/// The whole config is validated first. A configured `path` selects SQLite;
/// otherwise records live in memory.
pub fn open_store(config: &RuntimeConfig) -> Result<Arc<dyn ReliabilityStore>, ServiceError> {
    config.validate()?;
    let params = config.reliability;
    let timeout = config.store.lock_timeout;

    let store: Arc<dyn ReliabilityStore> = match &config.store.path {
        Some(path) => Arc::new(SqliteReliabilityStore::open(path, params, timeout)?),
        None => Arc::new(InMemoryReliabilityStore::new(params, timeout)?),
    };
    Ok(store)
}
