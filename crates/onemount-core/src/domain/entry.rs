//! Entry - the persisted metadata record for a drive item
//!
//! Every file and directory the filesystem knows about is one `Entry` in the
//! metadata store, keyed by item ID and carrying its synchronization state.
//!
//! ## State Machine
//!
//! ```text
//!   (create-remote)          (hydration)           (local modify)
//!        ┌──────┐  ──────────►  ┌──────────┐  ──────────►  ┌─────────────┐
//!        │ghost │               │ hydrated │               │ dirty_local │
//!        └──────┘  ◄──────────  └──────────┘  ◄──────────  └─────────────┘
//!            │       (eviction)      │        (upload ok)        │
//!            │                       │                           │
//!            └───────────────────────┴──────────┬────────────────┘
//!                                               ▼
//!                                          ┌─────────┐
//!                                          │ deleted │ (terminal)
//!                                          └─────────┘
//! ```
//!
//! The allowed transitions are enforced by the state controller in
//! [`super::transition`]; this module only defines the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CoreError;

use super::newtypes::{ETag, ItemId, QuickXorHash};

// ============================================================================
// ItemState
// ============================================================================

/// Synchronization state of an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Metadata only; the body lives in the cloud. Size, hash and etag are
    /// preserved so eviction never loses metadata.
    #[default]
    Ghost,
    /// Body present in the content cache and matching the remote version.
    Hydrated,
    /// Body present in the content cache with local modifications awaiting
    /// upload.
    DirtyLocal,
    /// Tombstoned; retained until the remote confirms, then purged.
    Deleted,
}

impl ItemState {
    /// True when the content cache is expected to hold a body for this item.
    #[must_use]
    pub fn has_content(&self) -> bool {
        matches!(self, ItemState::Hydrated | ItemState::DirtyLocal)
    }

    /// True when local edits are pending upload.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self, ItemState::DirtyLocal)
    }

    /// True when the item is tombstoned.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self, ItemState::Deleted)
    }

    /// The state name as a static string.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Ghost => "ghost",
            ItemState::Hydrated => "hydrated",
            ItemState::DirtyLocal => "dirty_local",
            ItemState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// ItemKind
// ============================================================================

/// Whether an item is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Directory,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::File => write!(f, "file"),
            ItemKind::Directory => write!(f, "directory"),
        }
    }
}

// ============================================================================
// Restricted names
// ============================================================================

/// Names OneDrive reserves outright (matched case-insensitively).
const RESERVED_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL", ".lock", "desktop.ini"];

/// Characters forbidden anywhere in a name.
const RESTRICTED_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '/', '\\', '|'];

/// Maximum name length in bytes (POSIX NAME_MAX).
pub const NAME_MAX: usize = 255;

/// Validates a file or directory name against the OneDrive restricted set.
///
/// Rejected: empty names, `.` and `..`, the reserved device names
/// (`CON`, `PRN`, `AUX`, `NUL`, `COM0`-`COM9`, `LPT0`-`LPT9`), names
/// containing `_vti_`, the literal names `.lock` and `desktop.ini`, any of
/// the characters `"*:<>?/\|`, and names longer than [`NAME_MAX`] bytes.
///
/// Checks run before any remote call so invalid creations fail fast with
/// `InvalidArgument`.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::InvalidArgument(format!(
            "restricted name: {name:?}"
        )));
    }
    if name.len() > NAME_MAX {
        return Err(CoreError::InvalidArgument(format!(
            "name exceeds {NAME_MAX} bytes"
        )));
    }
    if let Some(c) = name.chars().find(|c| RESTRICTED_CHARS.contains(c)) {
        return Err(CoreError::InvalidArgument(format!(
            "name contains restricted character {c:?}: {name}"
        )));
    }

    let lower = name.to_lowercase();
    if RESERVED_NAMES.iter().any(|r| r.to_lowercase() == lower) {
        return Err(CoreError::InvalidArgument(format!(
            "reserved name: {name}"
        )));
    }
    // COM0-COM9 and LPT0-LPT9
    if lower.len() == 4
        && (lower.starts_with("com") || lower.starts_with("lpt"))
        && lower.as_bytes()[3].is_ascii_digit()
    {
        return Err(CoreError::InvalidArgument(format!(
            "reserved device name: {name}"
        )));
    }
    if lower.contains("_vti_") {
        return Err(CoreError::InvalidArgument(format!(
            "name contains restricted sequence _vti_: {name}"
        )));
    }

    Ok(())
}

// ============================================================================
// Entry
// ============================================================================

/// The persisted metadata record for one drive item.
///
/// Exactly one entry exists per item ID. Directories carry the ordered list
/// of their children's IDs; `pending_remote` is true while a locally created
/// item awaits server visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Globally unique item ID; local IDs carry the `local-` prefix until
    /// reconciled.
    pub id: ItemId,
    /// Parent item ID; `None` only for the drive root.
    pub parent_id: Option<ItemId>,
    /// Case-preserving display name; lookups are case-insensitive.
    pub name: String,
    /// File or directory.
    pub kind: ItemKind,
    /// Synchronization state.
    pub state: ItemState,
    /// Body size in bytes (0 for directories).
    pub size: u64,
    /// QuickXorHash of the body, when known.
    pub content_hash: Option<QuickXorHash>,
    /// Server version tag, when known.
    pub etag: Option<ETag>,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
    /// Ordered child IDs (directories only).
    #[serde(default)]
    pub children: Vec<ItemId>,
    /// True while a locally created item is not yet visible in the server's
    /// child listing.
    #[serde(default)]
    pub pending_remote: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Creates the drive root entry.
    #[must_use]
    pub fn root(id: ItemId) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id: None,
            name: String::new(),
            kind: ItemKind::Directory,
            state: ItemState::Hydrated,
            size: 0,
            content_hash: None,
            etag: None,
            mtime: now,
            children: Vec::new(),
            pending_remote: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a ghost entry from remote metadata (delta ingest path).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new_remote(
        id: ItemId,
        parent_id: ItemId,
        name: String,
        kind: ItemKind,
        size: u64,
        content_hash: Option<QuickXorHash>,
        etag: Option<ETag>,
        mtime: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id: Some(parent_id),
            name,
            kind,
            state: ItemState::Ghost,
            size,
            content_hash,
            etag,
            mtime,
            children: Vec::new(),
            pending_remote: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a locally minted file entry in `dirty_local` state.
    ///
    /// The ID is a fresh `local-` ID; `pending_remote` is set until an
    /// upload succeeds and reconciliation swaps in the server ID.
    pub fn new_local_file(parent_id: ItemId, name: &str) -> Result<Self, CoreError> {
        validate_name(name)?;
        let now = Utc::now();
        Ok(Self {
            id: ItemId::local(),
            parent_id: Some(parent_id),
            name: name.to_string(),
            kind: ItemKind::File,
            state: ItemState::DirtyLocal,
            size: 0,
            content_hash: None,
            etag: None,
            mtime: now,
            children: Vec::new(),
            pending_remote: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Creates a locally minted directory entry in `dirty_local` state.
    pub fn new_local_dir(parent_id: ItemId, name: &str) -> Result<Self, CoreError> {
        let mut entry = Self::new_local_file(parent_id, name)?;
        entry.kind = ItemKind::Directory;
        Ok(entry)
    }

    /// True if this entry is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ItemKind::Directory)
    }

    /// True if this entry is the drive root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Adds a child ID, keeping the list free of duplicates.
    pub fn add_child(&mut self, child: ItemId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Removes a child ID if present.
    pub fn remove_child(&mut self, child: &ItemId) {
        self.children.retain(|c| c != child);
    }

    /// Checks the record-level invariants that must hold after every
    /// committed mutation.
    ///
    /// Cross-record invariants (parent existence, cache presence for
    /// hydrated entries) are checked by the store's validation pass, which
    /// has the whole catalog in view.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.is_root() {
            if !self.is_directory() {
                return Err(CoreError::Schema("root entry must be a directory".into()));
            }
            return Ok(());
        }

        if self.name.is_empty() {
            return Err(CoreError::Schema(format!("entry {} has empty name", self.id)));
        }
        if !self.is_directory() && !self.children.is_empty() {
            return Err(CoreError::Schema(format!(
                "file entry {} has children",
                self.id
            )));
        }
        if self.pending_remote && !self.id.is_local() {
            return Err(CoreError::Schema(format!(
                "entry {} is pending_remote but carries a server id",
                self.id
            )));
        }
        Ok(())
    }
}
