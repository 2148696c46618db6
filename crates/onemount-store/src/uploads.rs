//! Persistence for resumable upload sessions
//!
//! The upload manager writes a session record after every successful chunk;
//! on restart the bucket is scanned so interrupted sessions can be cancelled
//! server-side and requeued.

use sqlx::Row;

use onemount_core::domain::{ItemId, UploadSession};

use crate::{DatabasePool, StoreError};

/// The `uploads` bucket.
pub struct UploadStore {
    pool: DatabasePool,
}

impl UploadStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Upserts a session record.
    pub async fn save(&self, session: &UploadSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)
            .map_err(|e| StoreError::Schema(format!("serialize upload session: {e}")))?;
        sqlx::query("INSERT OR REPLACE INTO uploads (id, record) VALUES (?, ?)")
            .bind(session.id.as_str())
            .bind(&record)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Loads one session if present.
    pub async fn get(&self, id: &ItemId) -> Result<Option<UploadSession>, StoreError> {
        let record: Option<String> = sqlx::query_scalar("SELECT record FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool.pool())
            .await?;
        match record {
            Some(r) => Ok(Some(serde_json::from_str(&r).map_err(|e| {
                StoreError::Schema(format!("invalid upload session record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Loads every persisted session (restart scan).
    pub async fn load_all(&self) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query("SELECT record FROM uploads")
            .fetch_all(self.pool.pool())
            .await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let record: String = row.get("record");
            sessions.push(serde_json::from_str(&record).map_err(|e| {
                StoreError::Schema(format!("invalid upload session record: {e}"))
            })?);
        }
        Ok(sessions)
    }

    /// Removes a session record (on completion or cancellation).
    pub async fn remove(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::domain::Priority;

    const CHUNK: u64 = 10 * 1024 * 1024;

    async fn store() -> UploadStore {
        UploadStore::new(DatabasePool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_save_and_reload_after_restart() {
        let s = store().await;
        let mut session =
            UploadSession::new(ItemId::local(), "big.bin", CHUNK * 5, CHUNK, Priority::Normal)
                .unwrap();
        session.upload_url = Some("https://upload.example/s1".to_string());
        session.record_chunk(1, CHUNK);
        session.record_chunk(2, CHUNK);
        s.save(&session).await.unwrap();

        // restart scan sees the persisted progress
        let loaded = s.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].last_successful_chunk, 2);
        assert_eq!(loaded[0].bytes_uploaded, 2 * CHUNK);
        assert!(loaded[0].can_resume);
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let s = store().await;
        let mut session =
            UploadSession::new(ItemId::local(), "a.bin", CHUNK * 2, CHUNK, Priority::High)
                .unwrap();
        s.save(&session).await.unwrap();
        session.record_chunk(1, CHUNK);
        s.save(&session).await.unwrap();

        let loaded = s.get(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_successful_chunk, 1);
        assert_eq!(s.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let s = store().await;
        let session =
            UploadSession::new(ItemId::local(), "a.bin", CHUNK, CHUNK, Priority::Normal).unwrap();
        s.save(&session).await.unwrap();
        s.remove(&session.id).await.unwrap();
        assert!(s.get(&session.id).await.unwrap().is_none());
        assert!(s.load_all().await.unwrap().is_empty());
    }
}
