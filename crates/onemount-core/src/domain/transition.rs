//! State controller - validated transitions across the item states
//!
//! Every state change in the system goes through [`StateController::commit`],
//! which enforces the transition table and journals the change with a cause
//! code so tests can assert whole state trajectories.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CoreError;

use super::entry::ItemState;
use super::newtypes::ItemId;

// ============================================================================
// TransitionCause
// ============================================================================

/// Why a transition happened. Journaled alongside each committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Remote delta ingest created a new ghost entry
    CreateRemote,
    /// A local operation created an entry whose body is already cached
    CreateLocalHydrated,
    /// `create`/`mkdir` minted a local entry awaiting upload
    CreateLocalDirty,
    /// A download finished and the body landed in the cache
    HydrationComplete,
    /// A write hit a ghost stub before hydration
    LocalWriteOnStub,
    /// The server reported the item deleted
    RemoteTombstone,
    /// The body was evicted from the cache; metadata preserved
    Eviction,
    /// Remote metadata refreshed without invalidating the cached body
    RefreshInPlace,
    /// A local write dirtied a hydrated body
    LocalModify,
    /// `unlink`/`rmdir` tombstoned the entry
    Unlink,
    /// An upload completed and the local body became authoritative
    UploadSuccess,
    /// Further local edits while already dirty
    AdditionalLocalEdit,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionCause::CreateRemote => "create_remote",
            TransitionCause::CreateLocalHydrated => "create_local_hydrated",
            TransitionCause::CreateLocalDirty => "create_local_dirty",
            TransitionCause::HydrationComplete => "hydration_complete",
            TransitionCause::LocalWriteOnStub => "local_write_on_stub",
            TransitionCause::RemoteTombstone => "remote_tombstone",
            TransitionCause::Eviction => "eviction",
            TransitionCause::RefreshInPlace => "refresh_in_place",
            TransitionCause::LocalModify => "local_modify",
            TransitionCause::Unlink => "unlink",
            TransitionCause::UploadSuccess => "upload_success",
            TransitionCause::AdditionalLocalEdit => "additional_local_edit",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Transition table
// ============================================================================

/// Whether a transition is allowed. `from = None` means entry creation.
#[must_use]
pub fn allowed(from: Option<ItemState>, to: ItemState) -> bool {
    use ItemState::*;
    match (from, to) {
        // Creation
        (None, Ghost) | (None, Hydrated) | (None, DirtyLocal) => true,
        (None, Deleted) => false,

        // Ghost
        (Some(Ghost), Hydrated) => true,    // hydration-complete
        (Some(Ghost), DirtyLocal) => true,  // local-write-on-stub
        (Some(Ghost), Deleted) => true,     // remote-tombstone
        (Some(Ghost), Ghost) => false,

        // Hydrated
        (Some(Hydrated), Ghost) => true,      // eviction
        (Some(Hydrated), Hydrated) => true,   // refresh-in-place
        (Some(Hydrated), DirtyLocal) => true, // local-modify
        (Some(Hydrated), Deleted) => true,    // unlink / tombstone

        // DirtyLocal
        (Some(DirtyLocal), Hydrated) => true,   // upload-success
        (Some(DirtyLocal), DirtyLocal) => true, // additional local edits
        (Some(DirtyLocal), Deleted) => true,    // unlink
        (Some(DirtyLocal), Ghost) => false,

        // Deleted is terminal
        (Some(Deleted), _) => false,
    }
}

// ============================================================================
// TransitionRecord & StateController
// ============================================================================

/// One committed transition in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: ItemId,
    pub from: Option<ItemState>,
    pub to: ItemState,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
}

/// Validates transitions and keeps the journal.
///
/// The controller is shared across subsystems; the journal is bounded only
/// by test lifetimes in practice (the store truncates it periodically in
/// long-running processes via [`StateController::truncate_journal`]).
#[derive(Debug, Default)]
pub struct StateController {
    journal: Mutex<Vec<TransitionRecord>>,
}

impl StateController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a transition without committing it.
    pub fn check(&self, from: Option<ItemState>, to: ItemState) -> Result<(), CoreError> {
        if allowed(from, to) {
            Ok(())
        } else {
            Err(CoreError::TransitionDenied {
                from: from.map_or_else(|| "(none)".to_string(), |s| s.name().to_string()),
                to: to.name().to_string(),
            })
        }
    }

    /// Validates and journals a transition, returning the record.
    pub fn commit(
        &self,
        id: &ItemId,
        from: Option<ItemState>,
        to: ItemState,
        cause: TransitionCause,
    ) -> Result<TransitionRecord, CoreError> {
        self.check(from, to)?;
        let record = TransitionRecord {
            id: id.clone(),
            from,
            to,
            cause,
            at: Utc::now(),
        };
        tracing::debug!(
            id = %record.id,
            from = record.from.map(|s| s.name()).unwrap_or("(none)"),
            to = record.to.name(),
            cause = %record.cause,
            "State transition"
        );
        self.journal.lock().unwrap().push(record.clone());
        Ok(record)
    }

    /// Snapshot of the full journal.
    #[must_use]
    pub fn journal(&self) -> Vec<TransitionRecord> {
        self.journal.lock().unwrap().clone()
    }

    /// Journal entries for one item, in commit order.
    #[must_use]
    pub fn journal_for(&self, id: &ItemId) -> Vec<TransitionRecord> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.id == id)
            .cloned()
            .collect()
    }

    /// Drops all but the most recent `keep` records.
    pub fn truncate_journal(&self, keep: usize) {
        let mut journal = self.journal.lock().unwrap();
        let len = journal.len();
        if len > keep {
            journal.drain(..len - keep);
        }
    }
}
