//! OneMount Conflict - divergent-edit detection and resolution
//!
//! Detects when a locally modified item has also changed remotely, picks a
//! strategy (globally or per-path via glob rules) and applies the outcome to
//! the metadata store and content cache.

pub mod detector;
pub mod namer;
pub mod resolver;
pub mod strategy;

use thiserror::Error;

pub use detector::{detect, Conflict, ConflictKind};
pub use namer::conflict_copy_name;
pub use resolver::{ConflictResolver, ResolutionOutcome};
pub use strategy::{decide, parse_strategy, Outcome, PolicyRules, Strategy};

/// Errors during conflict resolution.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Metadata store failure while applying an outcome
    #[error("store error during resolution: {0}")]
    Store(#[from] onemount_store::StoreError),

    /// Content cache failure while applying an outcome
    #[error("cache error during resolution: {0}")]
    Cache(#[from] onemount_cache::CacheError),

    /// Domain-level failure
    #[error(transparent)]
    Core(#[from] onemount_core::CoreError),
}
