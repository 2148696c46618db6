//! The persisted offline change log
//!
//! Append-only while offline; drained in order on reconnect. Each record is
//! removed individually once its replay succeeds, so a restart mid-drain
//! resumes from the log as ground truth.

use sqlx::Row;

use onemount_core::domain::{ItemId, OfflineChange};

use crate::{DatabasePool, StoreError};

/// The `offline_changes` bucket.
pub struct OfflineLog {
    pool: DatabasePool,
}

impl OfflineLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Appends a change, returning its sequence number.
    pub async fn append(&self, change: &OfflineChange) -> Result<i64, StoreError> {
        let record = serde_json::to_string(change)
            .map_err(|e| StoreError::Schema(format!("serialize offline change: {e}")))?;
        let result = sqlx::query(
            "INSERT INTO offline_changes (item_id, timestamp, record) VALUES (?, ?, ?)",
        )
        .bind(change.id.as_str())
        .bind(change.timestamp.to_rfc3339())
        .bind(&record)
        .execute(self.pool.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// All changes in timestamp order (sequence order breaks ties).
    pub async fn all(&self) -> Result<Vec<(i64, OfflineChange)>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, record FROM offline_changes ORDER BY timestamp ASC, seq ASC",
        )
        .fetch_all(self.pool.pool())
        .await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.get("seq");
            let record: String = row.get("record");
            let change: OfflineChange = serde_json::from_str(&record)
                .map_err(|e| StoreError::Schema(format!("invalid offline change: {e}")))?;
            changes.push((seq, change));
        }
        Ok(changes)
    }

    /// Changes recorded for one item, oldest first.
    pub async fn for_item(&self, id: &ItemId) -> Result<Vec<OfflineChange>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM offline_changes WHERE item_id = ? \
             ORDER BY timestamp ASC, seq ASC",
        )
        .bind(id.as_str())
        .fetch_all(self.pool.pool())
        .await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let record: String = row.get("record");
            changes.push(serde_json::from_str(&record).map_err(|e| {
                StoreError::Schema(format!("invalid offline change: {e}"))
            })?);
        }
        Ok(changes)
    }

    /// The most recent change recorded for one item.
    pub async fn last_for_item(&self, id: &ItemId) -> Result<Option<OfflineChange>, StoreError> {
        Ok(self.for_item(id).await?.pop())
    }

    /// Removes a drained change.
    pub async fn remove(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM offline_changes WHERE seq = ?")
            .bind(seq)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Rewrites references to `old` onto `new` after ID reconciliation.
    pub async fn move_id(&self, old: &ItemId, new: &ItemId) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT seq, record FROM offline_changes WHERE item_id = ?")
            .bind(old.as_str())
            .fetch_all(self.pool.pool())
            .await?;
        for row in &rows {
            let seq: i64 = row.get("seq");
            let record: String = row.get("record");
            let mut change: OfflineChange = serde_json::from_str(&record)
                .map_err(|e| StoreError::Schema(format!("invalid offline change: {e}")))?;
            change.id = new.clone();
            let updated = serde_json::to_string(&change)
                .map_err(|e| StoreError::Schema(format!("serialize offline change: {e}")))?;
            sqlx::query("UPDATE offline_changes SET item_id = ?, record = ? WHERE seq = ?")
                .bind(new.as_str())
                .bind(&updated)
                .bind(seq)
                .execute(self.pool.pool())
                .await?;
        }
        Ok(())
    }

    /// Number of pending changes.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_changes")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(count as u64)
    }

    /// True when no changes are pending.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::domain::OfflineChangeKind;

    async fn log() -> OfflineLog {
        OfflineLog::new(DatabasePool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_append_and_ordered_iteration() {
        let log = log().await;
        let a = OfflineChange::new(ItemId::local(), OfflineChangeKind::Create, "/a");
        let b = OfflineChange::new(ItemId::local(), OfflineChangeKind::Modify, "/b");
        log.append(&a).await.unwrap();
        log.append(&b).await.unwrap();

        let all = log.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.path, "/a");
        assert_eq!(all[1].1.path, "/b");
    }

    #[tokio::test]
    async fn test_remove_clears_drained_entry() {
        let log = log().await;
        let change = OfflineChange::new(ItemId::local(), OfflineChangeKind::Delete, "/x");
        let seq = log.append(&change).await.unwrap();
        assert!(!log.is_empty().await.unwrap());

        log.remove(seq).await.unwrap();
        assert!(log.is_empty().await.unwrap());
        // removing again is harmless (idempotent drain)
        log.remove(seq).await.unwrap();
    }

    #[tokio::test]
    async fn test_for_item_and_last() {
        let log = log().await;
        let id = ItemId::local();
        log.append(&OfflineChange::new(id.clone(), OfflineChangeKind::Create, "/f"))
            .await
            .unwrap();
        log.append(&OfflineChange::new(id.clone(), OfflineChangeKind::Modify, "/f"))
            .await
            .unwrap();
        log.append(&OfflineChange::new(
            ItemId::local(),
            OfflineChangeKind::Create,
            "/other",
        ))
        .await
        .unwrap();

        let changes = log.for_item(&id).await.unwrap();
        assert_eq!(changes.len(), 2);
        let last = log.last_for_item(&id).await.unwrap().unwrap();
        assert_eq!(last.kind, OfflineChangeKind::Modify);
    }

    #[tokio::test]
    async fn test_move_id_rewrites_records() {
        let log = log().await;
        let old = ItemId::local();
        log.append(&OfflineChange::new(old.clone(), OfflineChangeKind::Modify, "/f"))
            .await
            .unwrap();

        let new = ItemId::new("SERVER-1").unwrap();
        log.move_id(&old, &new).await.unwrap();

        assert!(log.for_item(&old).await.unwrap().is_empty());
        let moved = log.for_item(&new).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, new);
    }
}
