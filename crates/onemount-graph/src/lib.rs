//! OneMount Graph - Microsoft Graph API client
//!
//! Typed HTTP plumbing for the endpoints the sync core consumes:
//! item metadata, paged child listings, content download/upload, resumable
//! upload sessions, rename/delete, the incremental delta feed and the drive
//! quota. The [`client::GraphClient`] implements the core's `RemoteDrive`
//! port (see [`provider`]).

pub mod client;
pub mod delta;
pub mod items;
pub mod provider;
pub mod upload;

use onemount_core::CoreError;
use thiserror::Error;

pub use client::GraphClient;

/// Errors from Graph API plumbing.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Transport-level failure (DNS, TLS, connect, timeout)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 401 - the bearer token was rejected
    #[error("unauthorized")]
    Unauthorized,

    /// 429 - server asked us to back off
    #[error("throttled, retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },

    /// 404 - the item does not exist remotely
    #[error("remote item not found")]
    NotFound,

    /// 409 nameAlreadyExists - a sibling with this name exists
    #[error("name already exists in target directory")]
    NameAlreadyExists,

    /// 410 Gone - the delta cursor expired; a full resync is required
    #[error("delta cursor expired")]
    CursorExpired,

    /// Any other non-success status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Local I/O failure while streaming a body
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GraphError> for CoreError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Unauthorized => CoreError::Unauthorized("graph".to_string()),
            GraphError::Throttled { retry_after_secs } => {
                CoreError::Throttled { retry_after_secs }
            }
            GraphError::NotFound => CoreError::NotFound("remote item".to_string()),
            GraphError::NameAlreadyExists => {
                CoreError::AlreadyExists("remote name".to_string())
            }
            GraphError::CursorExpired => {
                CoreError::InvalidArgument("delta cursor expired".to_string())
            }
            GraphError::Transport(e) if e.is_timeout() => CoreError::Timeout(e.to_string()),
            GraphError::Transport(e) => CoreError::NetworkUnavailable(e.to_string()),
            GraphError::Status { status, body } => {
                CoreError::Storage(format!("graph status {status}: {body}"))
            }
            GraphError::Io(e) => CoreError::Storage(e.to_string()),
        }
    }
}
