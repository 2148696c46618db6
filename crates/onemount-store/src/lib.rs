//! OneMount Store - durable metadata catalog
//!
//! One SQLite database file holds four buckets:
//! - `metadata_v2` - `Entry` records keyed by item ID
//! - `uploads` - resumable upload sessions
//! - `offline_changes` - the append-only offline change log
//! - `delta` - the delta cursor
//!
//! The legacy `metadata` bucket from earlier releases is auto-migrated on
//! first open. All mutations are atomic: either fully durable on return or
//! not visible.

pub mod migrate;
pub mod offline;
pub mod pool;
pub mod store;
pub mod uploads;
pub mod validate;

use onemount_core::CoreError;
use thiserror::Error;

pub use migrate::migrate_legacy_bucket;
pub use offline::OfflineLog;
pub use pool::DatabasePool;
pub use store::MetadataStore;
pub use uploads::UploadStore;
pub use validate::{validate_all, InvalidRow, ValidationReport};

/// Errors produced by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row could not be interpreted
    #[error("schema error: {0}")]
    Schema(String),

    /// Domain-level failure (not-found, transition denied, validation)
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(core) => core,
            StoreError::Schema(msg) => CoreError::Schema(msg),
            StoreError::Database(e) => CoreError::Storage(e.to_string()),
        }
    }
}
