//! Offline change records
//!
//! While the filesystem is offline, every mutating FUSE operation appends one
//! of these to the persisted offline log. The drain-on-reconnect orchestrator
//! replays them in timestamp order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::ItemId;

/// What kind of mutation happened while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfflineChangeKind {
    /// A file or directory was created
    Create,
    /// File content was modified
    Modify,
    /// The item was renamed or reparented
    Rename {
        new_parent: ItemId,
        new_name: String,
    },
    /// The item was deleted
    Delete,
}

impl fmt::Display for OfflineChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineChangeKind::Create => write!(f, "create"),
            OfflineChangeKind::Modify => write!(f, "modify"),
            OfflineChangeKind::Rename { new_name, .. } => write!(f, "rename -> {new_name}"),
            OfflineChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// One record in the append-only offline change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineChange {
    /// Item the change applies to (a local ID for offline creations)
    pub id: ItemId,
    /// The mutation kind, with rename target data inline
    #[serde(flatten)]
    pub kind: OfflineChangeKind,
    /// Path of the item at the time of the change (for diagnostics and
    /// conflict resolution)
    pub path: String,
    /// When the change was tracked
    pub timestamp: DateTime<Utc>,
}

impl OfflineChange {
    #[must_use]
    pub fn new(id: ItemId, kind: OfflineChangeKind, path: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}
