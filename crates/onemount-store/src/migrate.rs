//! Legacy-schema migration
//!
//! Earlier releases persisted items in a `metadata` bucket holding inode-style
//! rows. On first open the store converts each row through `inode -> entry`,
//! writes it into `metadata_v2`, and drops the legacy bucket only once every
//! row converted cleanly. Running the migration against an already-migrated
//! database is a no-op.

use serde::Deserialize;
use sqlx::Row;

use onemount_core::domain::{Entry, ItemId, ItemKind, ItemState};
use onemount_core::{ETag, QuickXorHash};

use crate::{DatabasePool, StoreError};

/// Row shape of the legacy `metadata` bucket.
#[derive(Debug, Deserialize)]
struct LegacyInode {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    name: String,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    mtime: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    state: Option<String>,
}

/// Converts one legacy inode row into a current `Entry`.
fn inode_to_entry(inode: LegacyInode) -> Result<Entry, StoreError> {
    let id = ItemId::new(&inode.id).map_err(|e| StoreError::Schema(e.to_string()))?;
    let parent_id = match inode.parent {
        Some(ref p) if !p.is_empty() => {
            Some(ItemId::new(p).map_err(|e| StoreError::Schema(e.to_string()))?)
        }
        _ => None,
    };

    let state = match inode.state.as_deref() {
        None | Some("ghost") | Some("online") => ItemState::Ghost,
        Some("hydrated") => ItemState::Hydrated,
        Some("dirty_local") | Some("modified") => ItemState::DirtyLocal,
        Some("deleted") => ItemState::Deleted,
        Some(other) => {
            return Err(StoreError::Schema(format!(
                "legacy row {} has unknown state {other:?}",
                inode.id
            )))
        }
    };

    let now = chrono::Utc::now();
    let mut entry = Entry {
        id,
        parent_id,
        name: inode.name,
        kind: if inode.dir {
            ItemKind::Directory
        } else {
            ItemKind::File
        },
        state,
        size: inode.size,
        content_hash: match inode.hash {
            Some(h) if !h.is_empty() => {
                Some(QuickXorHash::new(h).map_err(|e| StoreError::Schema(e.to_string()))?)
            }
            _ => None,
        },
        etag: match inode.etag {
            Some(e) if !e.is_empty() => {
                Some(ETag::new(e).map_err(|e| StoreError::Schema(e.to_string()))?)
            }
            _ => None,
        },
        mtime: inode.mtime.unwrap_or(now),
        children: Vec::new(),
        pending_remote: false,
        created_at: now,
        updated_at: now,
    };
    // Legacy rows did not persist children lists; rebuild below from
    // parent references.
    entry.children.clear();
    Ok(entry)
}

/// Migrates the legacy `metadata` bucket into `metadata_v2`.
///
/// Returns the number of rows migrated (0 when no legacy bucket exists).
/// The legacy bucket is dropped only after every row converted and was
/// written; a failure leaves both buckets in place for the next attempt.
pub async fn migrate_legacy_bucket(pool: &DatabasePool) -> Result<u64, StoreError> {
    // Does the legacy bucket exist at all?
    let legacy_exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
    )
    .fetch_optional(pool.pool())
    .await?;
    if legacy_exists.is_none() {
        return Ok(0);
    }

    tracing::info!("Legacy metadata bucket found, migrating");

    let rows = sqlx::query("SELECT id, inode FROM metadata")
        .fetch_all(pool.pool())
        .await?;

    // Convert everything first so a bad row aborts before any write.
    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let inode_json: String = row.get("inode");
        let inode: LegacyInode = serde_json::from_str(&inode_json)
            .map_err(|e| StoreError::Schema(format!("invalid legacy row: {e}")))?;
        entries.push(inode_to_entry(inode)?);
    }

    // Rebuild children lists from parent references.
    for i in 0..entries.len() {
        let child_ids: Vec<ItemId> = entries
            .iter()
            .filter(|c| c.parent_id.as_ref() == Some(&entries[i].id) && !c.state.is_deleted())
            .map(|c| c.id.clone())
            .collect();
        for id in child_ids {
            entries[i].add_child(id);
        }
    }

    let mut tx = pool.pool().begin().await?;
    let mut migrated = 0u64;
    for entry in &entries {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM metadata_v2 WHERE id = ?")
            .bind(entry.id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            continue; // idempotent re-run
        }
        let record = serde_json::to_string(entry)
            .map_err(|e| StoreError::Schema(format!("serialize migrated entry: {e}")))?;
        sqlx::query(
            "INSERT INTO metadata_v2 (id, parent_id, name_lower, state, record) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.id.as_str())
        .bind(entry.parent_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(entry.name.to_lowercase())
        .bind(entry.state.name())
        .bind(&record)
        .execute(&mut *tx)
        .await?;
        migrated += 1;
    }

    // Clean success: the legacy bucket goes away in the same transaction.
    sqlx::query("DROP TABLE metadata").execute(&mut *tx).await?;
    tx.commit().await?;

    tracing::info!(rows = migrated, "Legacy metadata migration complete");
    Ok(migrated)
}
