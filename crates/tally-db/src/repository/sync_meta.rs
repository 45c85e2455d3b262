//! # Sync Metadata Repository
//!
//! Key-value bookkeeping that must survive a restart, so the status
//! indicator shows the right "last synced" time immediately on boot.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};

/// Time of the last drain that finished with nothing left queued.
pub const LAST_SYNC_TIME: &str = "last_sync_time";
/// Error message of the last drain that ended in Error.
pub const LAST_ERROR: &str = "last_error";
/// Fetch time of the current catalog snapshot.
pub const CATALOG_FETCHED_AT: &str = "catalog_fetched_at";

/// Repository for the `sync_meta` table.
#[derive(Debug, Clone)]
pub struct SyncMetaRepository {
    pool: SqlitePool,
}

impl SyncMetaRepository {
    /// Creates a new SyncMetaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncMetaRepository { pool }
    }

    /// Reads a raw value.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Writes a raw value, replacing any previous one.
    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a key. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_meta WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Reads an RFC 3339 timestamp.
    pub async fn get_time(&self, key: &str) -> DbResult<Option<DateTime<Utc>>> {
        match self.get(key).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| DbError::Serialization(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Writes an RFC 3339 timestamp.
    pub async fn set_time(&self, key: &str, time: DateTime<Utc>) -> DbResult<()> {
        self.set(key, &time.to_rfc3339()).await
    }

    // =========================================================================
    // Typed Accessors
    // =========================================================================

    pub async fn last_sync_time(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.get_time(LAST_SYNC_TIME).await
    }

    pub async fn set_last_sync_time(&self, time: DateTime<Utc>) -> DbResult<()> {
        self.set_time(LAST_SYNC_TIME, time).await
    }

    pub async fn last_error(&self) -> DbResult<Option<String>> {
        self.get(LAST_ERROR).await
    }

    /// `None` clears the stored error.
    pub async fn set_last_error(&self, error: Option<&str>) -> DbResult<()> {
        match error {
            Some(message) => self.set(LAST_ERROR, message).await,
            None => self.delete(LAST_ERROR).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    async fn repo() -> SyncMetaRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().sync_meta()
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let repo = repo().await;
        assert_eq!(repo.get("k").await.unwrap(), None);

        repo.set("k", "one").await.unwrap();
        repo.set("k", "two").await.unwrap();
        assert_eq!(repo.get("k").await.unwrap().as_deref(), Some("two"));

        repo.delete("k").await.unwrap();
        assert_eq!(repo.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_sync_time_round_trip() {
        let repo = repo().await;
        assert_eq!(repo.last_sync_time().await.unwrap(), None);

        let now = Utc::now();
        repo.set_last_sync_time(now).await.unwrap();
        assert_eq!(repo.last_sync_time().await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_last_error_clears() {
        let repo = repo().await;
        repo.set_last_error(Some("HTTP 503")).await.unwrap();
        assert_eq!(repo.last_error().await.unwrap().as_deref(), Some("HTTP 503"));

        repo.set_last_error(None).await.unwrap();
        assert_eq!(repo.last_error().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_serialization_error() {
        let repo = repo().await;
        repo.set(LAST_SYNC_TIME, "yesterday").await.unwrap();
        assert!(matches!(
            repo.last_sync_time().await,
            Err(DbError::Serialization(_))
        ));
    }
}
