//! Error type for the filesystem core and its POSIX errno mapping
//!
//! Background sync errors never reach userspace; only errors surfaced by a
//! kernel-initiated operation are mapped here.

use libc::c_int;
use thiserror::Error;

use onemount_core::CoreError;

/// Errors surfaced by filesystem-core operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] onemount_store::StoreError),

    #[error(transparent)]
    Cache(#[from] onemount_cache::CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory not empty (rmdir)
    #[error("directory not empty")]
    NotEmpty,

    /// Operation requires a directory
    #[error("not a directory")]
    NotADirectory,

    /// Operation requires a file
    #[error("is a directory")]
    IsADirectory,

    /// xattr value does not fit the caller's buffer
    #[error("buffer too small")]
    Range,

    /// xattr not present
    #[error("no data")]
    NoData,
}

/// Maps a core error onto the closest POSIX errno.
#[must_use]
pub fn errno_for_core(err: &CoreError) -> c_int {
    match err {
        CoreError::NotFound(_) => libc::ENOENT,
        CoreError::InvalidArgument(_) => libc::EINVAL,
        CoreError::AlreadyExists(_) => libc::EEXIST,
        CoreError::Unauthorized(_) | CoreError::TokenExpired => libc::EREMOTEIO,
        CoreError::NetworkUnavailable(_) => libc::EREMOTEIO,
        CoreError::Throttled { .. } => libc::EREMOTEIO,
        CoreError::Timeout(_) => libc::ETIMEDOUT,
        // never escapes the core; defensive fallback
        CoreError::Conflict(_) => libc::EIO,
        CoreError::TransitionDenied { .. } => libc::EIO,
        CoreError::Storage(_) | CoreError::Schema(_) => libc::EIO,
    }
}

impl FsError {
    /// The errno reported to the kernel for this failure.
    #[must_use]
    pub fn errno(&self) -> c_int {
        match self {
            FsError::Core(core) => errno_for_core(core),
            FsError::Store(store) => {
                // store errors carry their domain failure when they have one
                match store {
                    onemount_store::StoreError::Core(core) => errno_for_core(core),
                    _ => libc::EIO,
                }
            }
            FsError::Cache(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::Range => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
        }
    }
}
