//! Conflict detection
//!
//! A conflict exists when an entry carries local changes (state
//! `dirty_local`, or a matching offline-change record) and the remote item
//! has diverged: different content hash, different etag, a different
//! parent/name, a deletion, or a name the restricted set rejects.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use onemount_core::domain::{validate_name, Entry, OfflineChange};
use onemount_core::ports::RemoteItem;

/// What kind of divergence was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides changed the body (or version metadata)
    Content,
    /// The remote name is not representable locally
    NameRestriction,
    /// The remote side deleted an item with local changes
    Delete,
}

/// A detected conflict, carrying both sides for the resolver.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// The local entry at detection time
    pub local: Entry,
    /// The remote item; `None` when the remote reports a bare tombstone
    pub remote: Option<RemoteItem>,
    /// The most recent offline-change record for this item, if any
    pub last_change: Option<OfflineChange>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Path used for per-path policy rules: the offline-change path when
    /// known, otherwise the bare name.
    #[must_use]
    pub fn policy_path(&self) -> String {
        self.last_change
            .as_ref()
            .map(|c| c.path.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.local.name.clone())
    }
}

/// Checks whether applying `remote` over `local` would clobber local edits.
///
/// Returns `None` when the entry has no local changes, or when the remote
/// side has not actually diverged.
pub fn detect(
    local: &Entry,
    remote: Option<&RemoteItem>,
    last_change: Option<&OfflineChange>,
) -> Option<Conflict> {
    let has_local_changes = local.state.is_dirty() || last_change.is_some();
    if !has_local_changes {
        return None;
    }

    let make = |kind| {
        info!(
            id = %local.id,
            name = %local.name,
            kind = ?kind,
            "Conflict detected"
        );
        Some(Conflict {
            kind,
            local: local.clone(),
            remote: remote.cloned(),
            last_change: last_change.cloned(),
            detected_at: Utc::now(),
        })
    };

    let Some(remote) = remote else {
        return make(ConflictKind::Delete);
    };
    if remote.is_deleted {
        return make(ConflictKind::Delete);
    }

    if validate_name(&remote.name).is_err() {
        return make(ConflictKind::NameRestriction);
    }

    let hash_differs = match (&local.content_hash, &remote.hash) {
        (Some(l), Some(r)) => l != r,
        (None, Some(_)) => true,
        _ => false,
    };
    let etag_differs = match (&local.etag, &remote.etag) {
        (Some(l), Some(r)) => l != r,
        (None, Some(_)) => true,
        _ => false,
    };
    let placement_differs = remote.name.to_lowercase() != local.name.to_lowercase()
        || (remote.parent_id.is_some() && remote.parent_id != local.parent_id);

    if hash_differs || etag_differs || placement_differs {
        return make(ConflictKind::Content);
    }

    debug!(id = %local.id, "Remote matches local baseline, no conflict");
    None
}
