//! Database connection pool management
//!
//! Wraps SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Automatic schema creation on first connection
//! - In-memory mode for testing

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::StoreError;

/// Manages a pool of SQLite connections for OneMount state persistence.
///
/// File-backed pools use WAL journal mode, 5 max connections and a 5-second
/// busy timeout; in-memory pools use a single connection so the database
/// survives across queries.
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Creates a new database pool backed by the file at `db_path`.
    ///
    /// Creates parent directories and the database file as needed and
    /// creates the bucket tables on first open.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Schema(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;

        tracing::info!(path = %db_path.display(), "Database pool initialized");

        Ok(Self { pool })
    }

    /// Creates an in-memory database pool for testing.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::create_schema(&pool).await?;

        tracing::debug!("In-memory database pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        let schema_sql = include_str!("migrations/initial.sql");
        sqlx::raw_sql(schema_sql).execute(pool).await?;
        tracing::debug!("Database schema ensured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_has_schema() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata_v2")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_pool_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("onemount.db");
        let _pool = DatabasePool::new(&db_path).await.unwrap();
        assert!(db_path.exists());
    }
}
