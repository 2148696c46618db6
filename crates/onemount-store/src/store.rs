//! The metadata catalog: `Entry` persistence with state-machine guarding
//!
//! Every mutation runs inside a SQLite transaction; readers only ever see
//! committed versions. State changes go through [`MetadataStore::transition`],
//! which is guarded by the shared [`StateController`] so illegal transitions
//! fail with `TransitionDenied` before anything is written.
//!
//! Parent/child consistency is maintained here: creating, deleting,
//! reparenting or reconciling an entry updates the parent's `children` list
//! in the same transaction.

use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use onemount_core::domain::{
    DeltaCursor, Entry, ItemId, ItemState, StateController, TransitionCause,
};
use onemount_core::CoreError;

use crate::{DatabasePool, StoreError};

/// Key under which the delta cursor is stored in the `delta` bucket.
const CURSOR_KEY: &str = "cursor";

/// Transactional catalog of `Entry` records.
pub struct MetadataStore {
    pool: DatabasePool,
    controller: Arc<StateController>,
}

// ============================================================================
// Row mapping
// ============================================================================

fn entry_from_row(row: &SqliteRow) -> Result<Entry, StoreError> {
    let record: String = row.get("record");
    serde_json::from_str(&record)
        .map_err(|e| StoreError::Schema(format!("invalid entry record: {e}")))
}

fn entry_to_record(entry: &Entry) -> Result<String, StoreError> {
    serde_json::to_string(entry)
        .map_err(|e| StoreError::Schema(format!("failed to serialize entry {}: {e}", entry.id)))
}

async fn write_entry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &Entry,
) -> Result<(), StoreError> {
    let record = entry_to_record(entry)?;
    sqlx::query(
        "INSERT OR REPLACE INTO metadata_v2 (id, parent_id, name_lower, state, record) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entry.id.as_str())
    .bind(entry.parent_id.as_ref().map(|p| p.as_str().to_string()))
    .bind(entry.name.to_lowercase())
    .bind(entry.state.name())
    .bind(&record)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_entry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &ItemId,
) -> Result<Option<Entry>, StoreError> {
    let row = sqlx::query("SELECT record FROM metadata_v2 WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(ref r) => Ok(Some(entry_from_row(r)?)),
        None => Ok(None),
    }
}

/// Adds `child` to `parent`'s children list inside the transaction.
async fn add_child_tx(
    tx: &mut Transaction<'_, Sqlite>,
    parent_id: &ItemId,
    child: &ItemId,
) -> Result<(), StoreError> {
    if let Some(mut parent) = load_entry_tx(tx, parent_id).await? {
        parent.add_child(child.clone());
        write_entry_tx(tx, &parent).await?;
    }
    Ok(())
}

/// Removes `child` from `parent`'s children list inside the transaction.
async fn remove_child_tx(
    tx: &mut Transaction<'_, Sqlite>,
    parent_id: &ItemId,
    child: &ItemId,
) -> Result<(), StoreError> {
    if let Some(mut parent) = load_entry_tx(tx, parent_id).await? {
        parent.remove_child(child);
        write_entry_tx(tx, &parent).await?;
    }
    Ok(())
}

// ============================================================================
// MetadataStore
// ============================================================================

impl MetadataStore {
    pub fn new(pool: DatabasePool, controller: Arc<StateController>) -> Self {
        Self { pool, controller }
    }

    /// The shared state controller (for journal assertions in tests).
    pub fn controller(&self) -> &Arc<StateController> {
        &self.controller
    }

    /// The underlying pool (shared with the upload store and offline log).
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches an entry, failing with `NotFound` if absent.
    pub async fn get(&self, id: &ItemId) -> Result<Entry, StoreError> {
        self.try_get(id)
            .await?
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(id.to_string())))
    }

    /// Fetches an entry if present.
    pub async fn try_get(&self, id: &ItemId) -> Result<Option<Entry>, StoreError> {
        let row = sqlx::query("SELECT record FROM metadata_v2 WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool.pool())
            .await?;
        match row {
            Some(ref r) => Ok(Some(entry_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// Non-deleted children of a directory.
    pub async fn children(&self, parent_id: &ItemId) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM metadata_v2 WHERE parent_id = ? AND state != 'deleted'",
        )
        .bind(parent_id.as_str())
        .fetch_all(self.pool.pool())
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    /// Case-insensitive lookup of a child by name.
    pub async fn lookup_child(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<Option<Entry>, StoreError> {
        let row = sqlx::query(
            "SELECT record FROM metadata_v2 \
             WHERE parent_id = ? AND name_lower = ? AND state != 'deleted'",
        )
        .bind(parent_id.as_str())
        .bind(name.to_lowercase())
        .fetch_optional(self.pool.pool())
        .await?;
        match row {
            Some(ref r) => Ok(Some(entry_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// All entries in a given state.
    pub async fn in_state(&self, state: ItemState) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query("SELECT record FROM metadata_v2 WHERE state = ?")
            .bind(state.name())
            .fetch_all(self.pool.pool())
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    /// Visits every entry in the catalog.
    pub async fn for_each<F>(&self, mut visitor: F) -> Result<(), StoreError>
    where
        F: FnMut(Entry),
    {
        let rows = sqlx::query("SELECT record FROM metadata_v2")
            .fetch_all(self.pool.pool())
            .await?;
        for row in &rows {
            visitor(entry_from_row(row)?);
        }
        Ok(())
    }

    /// Total entry count.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata_v2")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Creates a new entry, journaling the creation transition and linking
    /// it into its parent's children list atomically.
    pub async fn create(&self, entry: &Entry, cause: TransitionCause) -> Result<(), StoreError> {
        entry.validate()?;
        self.controller.check(None, entry.state)?;

        let mut tx = self.pool.pool().begin().await?;
        if load_entry_tx(&mut tx, &entry.id).await?.is_some() {
            return Err(StoreError::Core(CoreError::AlreadyExists(
                entry.id.to_string(),
            )));
        }
        write_entry_tx(&mut tx, entry).await?;
        if let Some(parent_id) = &entry.parent_id {
            add_child_tx(&mut tx, parent_id, &entry.id).await?;
        }
        tx.commit().await?;

        self.controller
            .commit(&entry.id, None, entry.state, cause)?;
        Ok(())
    }

    /// Upserts an entry verbatim. State transitions must go through
    /// [`MetadataStore::transition`]; this is for field refreshes and the
    /// migration path.
    pub async fn save(&self, entry: &Entry) -> Result<(), StoreError> {
        entry.validate()?;
        let mut tx = self.pool.pool().begin().await?;
        write_entry_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Compare-and-swap mutation of a single entry.
    ///
    /// The mutator runs on the committed version inside a transaction;
    /// state and parentage are restored afterwards so those invariants can
    /// only change through [`transition`](Self::transition) and
    /// [`reparent`](Self::reparent).
    pub async fn update<F>(&self, id: &ItemId, mutator: F) -> Result<Entry, StoreError>
    where
        F: FnOnce(&mut Entry),
    {
        let mut tx = self.pool.pool().begin().await?;
        let mut entry = load_entry_tx(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(id.to_string())))?;

        let state = entry.state;
        let parent = entry.parent_id.clone();
        mutator(&mut entry);
        entry.state = state;
        entry.parent_id = parent;
        entry.updated_at = chrono::Utc::now();
        entry.validate()?;

        write_entry_tx(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// State-machine-guarded transition. Tombstoning unlinks the entry from
    /// its parent's children list in the same transaction.
    pub async fn transition(
        &self,
        id: &ItemId,
        to: ItemState,
        cause: TransitionCause,
    ) -> Result<Entry, StoreError> {
        let mut tx = self.pool.pool().begin().await?;
        let mut entry = load_entry_tx(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(id.to_string())))?;

        let from = entry.state;
        self.controller.check(Some(from), to)?;

        entry.state = to;
        entry.updated_at = chrono::Utc::now();
        write_entry_tx(&mut tx, &entry).await?;

        if to == ItemState::Deleted {
            if let Some(parent_id) = entry.parent_id.clone() {
                remove_child_tx(&mut tx, &parent_id, id).await?;
            }
        }
        tx.commit().await?;

        self.controller.commit(id, Some(from), to, cause)?;
        Ok(entry)
    }

    /// Moves an entry under a new parent and/or name, keeping both parents'
    /// children lists consistent.
    pub async fn reparent(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<Entry, StoreError> {
        let mut tx = self.pool.pool().begin().await?;
        let mut entry = load_entry_tx(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(id.to_string())))?;

        let old_parent = entry.parent_id.clone();
        entry.parent_id = Some(new_parent.clone());
        entry.name = new_name.to_string();
        entry.updated_at = chrono::Utc::now();
        write_entry_tx(&mut tx, &entry).await?;

        match old_parent {
            Some(ref old) if old != new_parent => {
                remove_child_tx(&mut tx, old, id).await?;
                add_child_tx(&mut tx, new_parent, id).await?;
            }
            None => add_child_tx(&mut tx, new_parent, id).await?,
            _ => {}
        }
        tx.commit().await?;
        Ok(entry)
    }

    /// Hard-purges an entry (used once the remote confirms a tombstone).
    pub async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await?;
        if let Some(entry) = load_entry_tx(&mut tx, id).await? {
            if let Some(parent_id) = entry.parent_id {
                remove_child_tx(&mut tx, &parent_id, id).await?;
            }
        }
        sqlx::query("DELETE FROM metadata_v2 WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::trace!(id = %id, "Purged entry");
        Ok(())
    }

    /// ID reconciliation: rewrites every reference from `old` to `new`.
    ///
    /// Covers the entry's own key, the parent's children list, and (for
    /// directories) every child's `parent_id`. The content cache and inode
    /// graph perform their own `move_id` alongside this call.
    pub async fn move_id(&self, old: &ItemId, new: &ItemId) -> Result<Entry, StoreError> {
        let mut tx = self.pool.pool().begin().await?;
        let mut entry = load_entry_tx(&mut tx, old)
            .await?
            .ok_or_else(|| StoreError::Core(CoreError::NotFound(old.to_string())))?;

        entry.id = new.clone();
        entry.pending_remote = false;
        entry.updated_at = chrono::Utc::now();

        sqlx::query("DELETE FROM metadata_v2 WHERE id = ?")
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;
        write_entry_tx(&mut tx, &entry).await?;

        // Parent's children list
        if let Some(parent_id) = entry.parent_id.clone() {
            if let Some(mut parent) = load_entry_tx(&mut tx, &parent_id).await? {
                parent.remove_child(old);
                parent.add_child(new.clone());
                write_entry_tx(&mut tx, &parent).await?;
            }
        }

        // Children's parent references
        let child_rows = sqlx::query("SELECT record FROM metadata_v2 WHERE parent_id = ?")
            .bind(old.as_str())
            .fetch_all(&mut *tx)
            .await?;
        for row in &child_rows {
            let mut child = entry_from_row(row)?;
            child.parent_id = Some(new.clone());
            write_entry_tx(&mut tx, &child).await?;
        }

        tx.commit().await?;
        tracing::debug!(old = %old, new = %new, "Reconciled item id");
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Delta cursor
    // ------------------------------------------------------------------

    /// Persists the delta cursor. Called only after a change set has been
    /// fully ingested, so a crash replays rather than loses changes.
    pub async fn set_cursor(&self, cursor: &DeltaCursor) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO delta (k, cursor) VALUES (?, ?)")
            .bind(CURSOR_KEY)
            .bind(cursor.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// The last committed delta cursor.
    pub async fn cursor(&self) -> Result<Option<DeltaCursor>, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT cursor FROM delta WHERE k = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(self.pool.pool())
            .await?;
        match value {
            Some(v) => Ok(Some(
                DeltaCursor::new(v).map_err(|e| StoreError::Schema(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Clears the cursor (delta token expiry forces a full resync).
    pub async fn clear_cursor(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM delta WHERE k = ?")
            .bind(CURSOR_KEY)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::domain::ItemKind;

    async fn store() -> MetadataStore {
        let pool = DatabasePool::in_memory().await.unwrap();
        MetadataStore::new(pool, Arc::new(StateController::new()))
    }

    fn root_id() -> ItemId {
        ItemId::new("root").unwrap()
    }

    async fn store_with_root() -> MetadataStore {
        let s = store().await;
        let root = Entry::root(root_id());
        s.create(&root, TransitionCause::CreateLocalHydrated)
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let got = s.get(&entry.id).await.unwrap();
        assert_eq!(got.name, "a.txt");
        assert_eq!(got.state, ItemState::DirtyLocal);

        // parent's children updated in the same commit
        let root = s.get(&root_id()).await.unwrap();
        assert!(root.children.contains(&entry.id));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let s = store().await;
        let err = s.get(&ItemId::new("nope").unwrap()).await.unwrap_err();
        assert!(matches!(err, StoreError::Core(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        let err = s
            .create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Core(CoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_transition_denied_leaves_row_untouched() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        // dirty_local -> ghost is not in the table
        let err = s
            .transition(&entry.id, ItemState::Ghost, TransitionCause::Eviction)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Core(CoreError::TransitionDenied { .. })
        ));
        assert_eq!(s.get(&entry.id).await.unwrap().state, ItemState::DirtyLocal);
    }

    #[tokio::test]
    async fn test_transition_to_deleted_unlinks_from_parent() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        s.transition(&entry.id, ItemState::Deleted, TransitionCause::Unlink)
            .await
            .unwrap();

        let root = s.get(&root_id()).await.unwrap();
        assert!(!root.children.contains(&entry.id));
        // tombstone retained until purged
        assert_eq!(s.get(&entry.id).await.unwrap().state, ItemState::Deleted);
        assert!(s.children(&root_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_preserves_state_and_parent() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let updated = s
            .update(&entry.id, |e| {
                e.size = 42;
                e.state = ItemState::Deleted; // must be ignored
            })
            .await
            .unwrap();
        assert_eq!(updated.size, 42);
        assert_eq!(updated.state, ItemState::DirtyLocal);
    }

    #[tokio::test]
    async fn test_lookup_child_is_case_insensitive() {
        let s = store_with_root().await;
        let entry = Entry::new_local_file(root_id(), "Report.DOCX").unwrap();
        s.create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let found = s.lookup_child(&root_id(), "report.docx").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().name, "Report.DOCX");
    }

    #[tokio::test]
    async fn test_reparent_moves_between_children_lists() {
        let s = store_with_root().await;
        let dir = Entry::new_local_dir(root_id(), "docs").unwrap();
        s.create(&dir, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        let file = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&file, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        s.reparent(&file.id, &dir.id, "b.txt").await.unwrap();

        let root = s.get(&root_id()).await.unwrap();
        assert!(!root.children.contains(&file.id));
        let dir = s.get(&dir.id).await.unwrap();
        assert!(dir.children.contains(&file.id));
        let moved = s.get(&file.id).await.unwrap();
        assert_eq!(moved.name, "b.txt");
    }

    #[tokio::test]
    async fn test_move_id_rewrites_all_references() {
        let s = store_with_root().await;
        let dir = Entry::new_local_dir(root_id(), "pkg").unwrap();
        s.create(&dir, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        let inner = Entry::new_local_file(dir.id.clone(), "inner.txt").unwrap();
        s.create(&inner, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let server_id = ItemId::new("SERVER-XYZ").unwrap();
        let moved = s.move_id(&dir.id, &server_id).await.unwrap();
        assert_eq!(moved.id, server_id);
        assert!(!moved.pending_remote);

        // old key gone, new key present
        assert!(s.try_get(&dir.id).await.unwrap().is_none());
        assert!(s.try_get(&server_id).await.unwrap().is_some());

        // parent children updated
        let root = s.get(&root_id()).await.unwrap();
        assert!(root.children.contains(&server_id));
        assert!(!root.children.contains(&dir.id));

        // child reparented onto the server id
        let child = s.get(&inner.id).await.unwrap();
        assert_eq!(child.parent_id, Some(server_id.clone()));
        assert_eq!(s.children(&server_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let s = store().await;
        assert!(s.cursor().await.unwrap().is_none());

        let cursor = DeltaCursor::new("tok-1").unwrap();
        s.set_cursor(&cursor).await.unwrap();
        assert_eq!(s.cursor().await.unwrap(), Some(cursor));

        let cursor2 = DeltaCursor::new("tok-2").unwrap();
        s.set_cursor(&cursor2).await.unwrap();
        assert_eq!(s.cursor().await.unwrap(), Some(cursor2));

        s.clear_cursor().await.unwrap();
        assert!(s.cursor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_for_each_visits_all() {
        let s = store_with_root().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            let e = Entry::new_local_file(root_id(), name).unwrap();
            s.create(&e, TransitionCause::CreateLocalDirty)
                .await
                .unwrap();
        }
        let mut seen = 0;
        s.for_each(|_| seen += 1).await.unwrap();
        assert_eq!(seen, 4); // root + 3 files
    }

    #[tokio::test]
    async fn test_in_state_filter() {
        let s = store_with_root().await;
        let e = Entry::new_local_file(root_id(), "a.txt").unwrap();
        s.create(&e, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();

        let dirty = s.in_state(ItemState::DirtyLocal).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].kind, ItemKind::File);
        assert!(s.in_state(ItemState::Ghost).await.unwrap().is_empty());
    }
}
