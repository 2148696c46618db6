//! Ports - the remote-drive interface the sync core consumes
//!
//! The core never talks HTTP directly; it programs against [`RemoteDrive`].
//! The Graph adapter crate implements it for Microsoft Graph, and tests
//! substitute in-memory stubs.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{DeltaCursor, ETag, ItemId, QuickXorHash};
use crate::errors::CoreError;

// ============================================================================
// DTOs
// ============================================================================

/// Provider-agnostic view of a remote drive item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: ItemId,
    pub name: String,
    pub parent_id: Option<ItemId>,
    pub size: u64,
    pub etag: Option<ETag>,
    pub hash: Option<QuickXorHash>,
    pub mtime: Option<DateTime<Utc>>,
    pub is_directory: bool,
    pub is_deleted: bool,
}

/// One fully paged delta query result.
#[derive(Debug, Clone, Default)]
pub struct DeltaPage {
    /// Changed items in server-supplied order
    pub items: Vec<RemoteItem>,
    /// Cursor for the next incremental query (absent only on error paths)
    pub cursor: Option<DeltaCursor>,
}

/// Server-side resumable upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadHandle {
    /// Absolute URL chunks are PUT to
    pub upload_url: String,
    /// When the server will discard the session
    pub expires_at: Option<DateTime<Utc>>,
}

/// Drive storage quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveQuota {
    pub total: u64,
    pub used: u64,
    pub remaining: u64,
}

// ============================================================================
// RemoteDrive
// ============================================================================

/// Everything the sync core needs from the server side.
///
/// All methods carry their own deadline inside the implementation; callers
/// treat `CoreError::Timeout` as recoverable.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Cheap connectivity/auth probe (`/me`).
    async fn probe(&self) -> Result<(), CoreError>;

    /// Fetches the drive root item.
    async fn get_root(&self) -> Result<RemoteItem, CoreError>;

    /// Fetches one item's metadata.
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError>;

    /// Lists a directory's children, following pagination to completion.
    async fn list_children(&self, id: &ItemId) -> Result<Vec<RemoteItem>, CoreError>;

    /// Streams an item's body into `dest`, returning the byte count.
    async fn download_to(&self, id: &ItemId, dest: &Path) -> Result<u64, CoreError>;

    /// Single-request upload for small bodies; returns the updated item.
    async fn upload_small(
        &self,
        parent_id: &ItemId,
        name: &str,
        data: &[u8],
    ) -> Result<RemoteItem, CoreError>;

    /// Creates a resumable upload session.
    async fn create_upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<UploadHandle, CoreError>;

    /// Uploads one chunk; returns the final item on the last chunk.
    async fn upload_chunk(
        &self,
        upload_url: &str,
        data: &[u8],
        offset: u64,
        total: u64,
    ) -> Result<Option<RemoteItem>, CoreError>;

    /// Cancels a resumable session server-side.
    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError>;

    /// Creates a directory.
    async fn mkdir(&self, parent_id: &ItemId, name: &str) -> Result<RemoteItem, CoreError>;

    /// Renames and/or reparents an item.
    async fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<RemoteItem, CoreError>;

    /// Tombstones an item.
    async fn delete(&self, id: &ItemId) -> Result<(), CoreError>;

    /// Incremental change feed. `None` cursor performs a full enumeration.
    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, CoreError>;

    /// Storage quota for statfs.
    async fn quota(&self) -> Result<DriveQuota, CoreError>;
}

impl RemoteItem {
    /// Kind helper mirroring `Entry::is_directory`.
    #[must_use]
    pub fn kind(&self) -> crate::domain::entry::ItemKind {
        if self.is_directory {
            crate::domain::entry::ItemKind::Directory
        } else {
            crate::domain::entry::ItemKind::File
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_item_kind() {
        let item = RemoteItem {
            id: ItemId::new("d1").unwrap(),
            name: "Documents".to_string(),
            parent_id: None,
            size: 0,
            etag: None,
            hash: None,
            mtime: None,
            is_directory: true,
            is_deleted: false,
        };
        assert_eq!(item.kind(), crate::domain::entry::ItemKind::Directory);
    }
}
