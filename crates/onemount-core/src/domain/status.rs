//! Externally observable file status
//!
//! The status notifier publishes one of these per path whenever a state
//! transition changes what a desktop shell or CLI would display.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::entry::ItemState;

/// What a file looks like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    /// Metadata stub; the body lives in the cloud
    Cloud,
    /// Fully cached and in sync with the server
    Local,
    /// Locally modified, upload pending
    LocalModified,
    /// An upload for this file is in flight
    Syncing,
    /// A download for this file is in flight
    Downloading,
    /// Cached body no longer matches the server version
    OutofSync,
    /// The last transfer for this file failed
    Error,
    /// Divergent local and remote edits await resolution
    Conflict,
}

impl FileStatus {
    /// The resting status for a given item state (no transfer in flight).
    #[must_use]
    pub fn for_state(state: ItemState) -> Self {
        match state {
            ItemState::Ghost => FileStatus::Cloud,
            ItemState::Hydrated => FileStatus::Local,
            ItemState::DirtyLocal => FileStatus::LocalModified,
            ItemState::Deleted => FileStatus::Cloud,
        }
    }

    /// Status name as shown to consumers.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            FileStatus::Cloud => "Cloud",
            FileStatus::Local => "Local",
            FileStatus::LocalModified => "LocalModified",
            FileStatus::Syncing => "Syncing",
            FileStatus::Downloading => "Downloading",
            FileStatus::OutofSync => "OutofSync",
            FileStatus::Error => "Error",
            FileStatus::Conflict => "Conflict",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
