//! OneMount Cache - on-disk store of file bodies
//!
//! Bodies are stored under the cache root keyed by item ID, with a
//! per-ID file handle registry so concurrent readers and writers of the
//! same item observe each other. A thumbnail variant keys objects by
//! `(id, size)`, and a background cleaner expires stale objects.

pub mod cleanup;
pub mod content;
pub mod thumbs;

use thiserror::Error;

pub use cleanup::CacheCleaner;
pub use content::{CacheHandle, ContentCache};
pub use thumbs::{ThumbnailCache, ThumbnailSize};

/// Errors from the content cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying filesystem failure
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No cached object for the requested ID
    #[error("no cached content for {0}")]
    Missing(String),
}

impl From<CacheError> for onemount_core::CoreError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Missing(id) => onemount_core::CoreError::NotFound(id),
            CacheError::Io(e) => onemount_core::CoreError::Storage(e.to_string()),
        }
    }
}
