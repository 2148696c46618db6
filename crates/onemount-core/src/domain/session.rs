//! Transfer session records
//!
//! Download sessions are transient; upload sessions are persisted to the
//! `uploads` bucket after every successful chunk so progress survives
//! restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CoreError;

use super::newtypes::{ETag, ItemId};

// ============================================================================
// Priority
// ============================================================================

/// Transfer and metadata-request priority.
///
/// Foreground FUSE operations use `High` so they bypass background tree
/// sync; the delta loop queues at `Background`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Background => write!(f, "background"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

// ============================================================================
// DownloadState
// ============================================================================

/// Lifecycle of a download (hydration) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Running,
    Completed,
    Errored,
}

impl DownloadState {
    /// True once the session can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Errored)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Queued => "queued",
            DownloadState::Running => "running",
            DownloadState::Completed => "completed",
            DownloadState::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Upload session
// ============================================================================

/// Permitted chunk size range for resumable uploads.
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Persistent record of an upload, small or chunked.
///
/// For resumable sessions, `last_successful_chunk`, `bytes_uploaded` and
/// `can_resume` are persisted after every chunk. On restart, sessions that
/// had started are cancelled server-side and requeued from the beginning;
/// the persisted progress is kept so a future resume path has the data it
/// needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Current item ID (may still be a local ID before reconciliation)
    pub id: ItemId,
    /// The pre-reconciliation ID, set once the server assigns a new one
    pub old_id: Option<ItemId>,
    /// File name at enqueue time
    pub name: String,
    /// Total body size in bytes
    pub size: u64,
    /// ETag the upload is replacing, when known
    pub etag: Option<ETag>,
    /// Resumable session URL, present once the session is created server-side
    pub upload_url: Option<String>,
    /// Index of the last chunk confirmed by the server (1-based; 0 = none)
    pub last_successful_chunk: u64,
    /// Bytes confirmed uploaded
    pub bytes_uploaded: u64,
    /// Total chunk count for this body
    pub total_chunks: u64,
    /// Whether the persisted progress is valid for a resume attempt
    pub can_resume: bool,
    /// Retry attempts made so far
    pub retries: u32,
    /// Queue priority
    pub priority: Priority,
    /// Last time a chunk or the whole body was confirmed
    pub last_progress_time: DateTime<Utc>,
}

impl UploadSession {
    /// Creates a session for a body of `size` bytes split into `chunk_size`
    /// chunks.
    ///
    /// Chunk sizes outside `[1 MiB, 100 MiB]` are rejected at construction.
    pub fn new(
        id: ItemId,
        name: impl Into<String>,
        size: u64,
        chunk_size: u64,
        priority: Priority,
    ) -> Result<Self, CoreError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(CoreError::InvalidArgument(format!(
                "chunk size {chunk_size} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"
            )));
        }
        let total_chunks = if size == 0 {
            1
        } else {
            size.div_ceil(chunk_size)
        };
        Ok(Self {
            id,
            old_id: None,
            name: name.into(),
            size,
            etag: None,
            upload_url: None,
            last_successful_chunk: 0,
            bytes_uploaded: 0,
            total_chunks,
            can_resume: false,
            retries: 0,
            priority,
            last_progress_time: Utc::now(),
        })
    }

    /// Records a confirmed chunk and refreshes the progress timestamp.
    pub fn record_chunk(&mut self, chunk_index: u64, bytes: u64) {
        self.last_successful_chunk = chunk_index;
        self.bytes_uploaded += bytes;
        self.can_resume = true;
        self.last_progress_time = Utc::now();
    }

    /// Confirmed progress as a percentage (0-100).
    ///
    /// Empty bodies are immediately complete.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if self.size == 0 {
            return 100;
        }
        ((self.bytes_uploaded * 100) / self.size).min(100) as u8
    }

    /// True when the session had started uploading before a restart.
    #[must_use]
    pub fn had_started(&self) -> bool {
        self.upload_url.is_some() && self.bytes_uploaded > 0
    }

    /// Resets chunk progress for a restart-from-beginning, preserving
    /// `can_resume` for diagnostics of the prior attempt.
    pub fn reset_progress(&mut self) {
        self.upload_url = None;
        self.last_successful_chunk = 0;
        self.bytes_uploaded = 0;
        self.last_progress_time = Utc::now();
    }
}
