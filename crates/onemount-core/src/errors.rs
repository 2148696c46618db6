//! Error kinds produced and consumed by the synchronization core
//!
//! Every subsystem maps its failures onto these variants; the FUSE adapter
//! maps them onto POSIX errnos at the kernel boundary.

use thiserror::Error;

/// Errors that can occur in core operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Item absent locally or remotely
    #[error("not found: {0}")]
    NotFound(String),

    /// Restricted name, bad xattr size, malformed input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An item with this name already exists in the target directory
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Auth must be refreshed before the operation can proceed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The access token has expired mid-operation
    #[error("access token expired")]
    TokenExpired,

    /// Server returned 429; back off before retrying
    #[error("throttled by server, retry after {retry_after_secs}s")]
    Throttled {
        /// Seconds the server asked us to wait
        retry_after_secs: u64,
    },

    /// Connectivity lost; the filesystem should flip to offline mode
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Divergent edit detected; handled by the conflict resolver
    #[error("conflict: {0}")]
    Conflict(String),

    /// Illegal state-machine transition; always a bug in the caller
    #[error("transition denied: {from} -> {to}")]
    TransitionDenied {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// On-disk cache or metadata store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted row could not be interpreted
    #[error("schema error: {0}")]
    Schema(String),
}

impl CoreError {
    /// Whether a retry of the same operation can reasonably succeed.
    ///
    /// Transition denials and schema errors are bugs or corruption; everything
    /// network-shaped is worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::Throttled { .. }
                | CoreError::NetworkUnavailable(_)
                | CoreError::Timeout(_)
                | CoreError::TokenExpired
                | CoreError::Unauthorized(_)
        )
    }

    /// Whether the error indicates lost connectivity.
    pub fn is_offline(&self) -> bool {
        matches!(self, CoreError::NetworkUnavailable(_))
    }
}
