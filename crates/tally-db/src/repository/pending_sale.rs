//! # Pending Sale Repository
//!
//! Durable storage for the offline sale queue.
//!
//! ## Guarded Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One Statement Per Transition                         │
//! │                                                                         │
//! │  UPDATE pending_sales                                                  │
//! │     SET status = 'confirmed', server_id = ?, attempts = attempts + 1   │
//! │   WHERE local_id = ? AND status = 'submitting'   ◄── expected source   │
//! │  RETURNING *                                                           │
//! │       │                                                                 │
//! │       ├── 1 row  → transition happened, new row returned               │
//! │       └── 0 rows → NotFound or InvalidTransition (nothing written)     │
//! │                                                                         │
//! │  A crash between two statements leaves the row in a valid state:      │
//! │  • Submitting leftovers are requeued by recover_interrupted()         │
//! │  • Confirmed leftovers are deleted by purge_confirmed()               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `attempts` counts completed submission attempts: retry, confirmation and
//! rejection each add one. Entering Submitting does not.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{PendingSale, PendingSaleStatus, SalePayload};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PendingSaleRow {
    local_id: String,
    server_id: Option<String>,
    payload: Json<SalePayload>,
    status: PendingSaleStatus,
    attempts: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PendingSaleRow> for PendingSale {
    fn from(row: PendingSaleRow) -> Self {
        PendingSale {
            local_id: row.local_id,
            server_id: row.server_id,
            payload: row.payload.0,
            status: row.status,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the pending sale queue.
#[derive(Debug, Clone)]
pub struct PendingSaleRepository {
    pool: SqlitePool,
}

impl PendingSaleRepository {
    /// Creates a new PendingSaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PendingSaleRepository { pool }
    }

    /// Inserts a new sale as Queued.
    ///
    /// ## Arguments
    /// * `local_id` - Client-generated UUID, also the idempotency key
    /// * `payload` - The validated sale
    /// * `created_at` - Local wall-clock time, the drain order key
    ///
    /// Single INSERT; returns once the write has committed.
    pub async fn insert(
        &self,
        local_id: &str,
        payload: &SalePayload,
        created_at: DateTime<Utc>,
    ) -> DbResult<PendingSale> {
        debug!(local_id = %local_id, lines = payload.lines.len(), "Inserting pending sale");

        let row = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            INSERT INTO pending_sales (
                local_id, seq, payload, status, attempts, created_at, updated_at
            ) VALUES (
                ?1,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM pending_sales),
                ?2, ?3, 0, ?4, ?4
            )
            RETURNING *
            "#,
        )
        .bind(local_id)
        .bind(Json(payload))
        .bind(PendingSaleStatus::Queued)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } if field.contains("local_id") => {
                DbError::UniqueViolation {
                    field,
                    value: local_id.to_string(),
                }
            }
            other => other,
        })?;

        Ok(row.into())
    }

    /// Gets a sale by local id, in any status.
    pub async fn get(&self, local_id: &str) -> DbResult<Option<PendingSale>> {
        let row = sqlx::query_as::<_, PendingSaleRow>(
            "SELECT * FROM pending_sales WHERE local_id = ?1",
        )
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PendingSale::from))
    }

    /// Lists Queued and Submitting sales, oldest first.
    ///
    /// Order is `created_at ASC, seq ASC`; seq breaks timestamp ties in
    /// insertion order.
    pub async fn list_pending(&self) -> DbResult<Vec<PendingSale>> {
        let rows = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            SELECT * FROM pending_sales
            WHERE status IN (?1, ?2)
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(PendingSaleStatus::Queued)
        .bind(PendingSaleStatus::Submitting)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingSale::from).collect())
    }

    /// Lists Rejected sales awaiting operator acknowledgement, oldest first.
    pub async fn list_rejected(&self) -> DbResult<Vec<PendingSale>> {
        let rows = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            SELECT * FROM pending_sales
            WHERE status = ?1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(PendingSaleStatus::Rejected)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingSale::from).collect())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Queued → Submitting.
    pub async fn mark_submitting(&self, local_id: &str) -> DbResult<PendingSale> {
        let row = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            UPDATE pending_sales SET
                status = ?2,
                updated_at = ?3
            WHERE local_id = ?1 AND status = ?4
            RETURNING *
            "#,
        )
        .bind(local_id)
        .bind(PendingSaleStatus::Submitting)
        .bind(Utc::now())
        .bind(PendingSaleStatus::Queued)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(local_id, PendingSaleStatus::Queued, row)
            .await
    }

    /// Submitting → Confirmed, recording the server-assigned id.
    pub async fn mark_confirmed(&self, local_id: &str, server_id: &str) -> DbResult<PendingSale> {
        let row = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            UPDATE pending_sales SET
                status = ?2,
                server_id = ?3,
                attempts = attempts + 1,
                last_error = NULL,
                updated_at = ?4
            WHERE local_id = ?1 AND status = ?5
            RETURNING *
            "#,
        )
        .bind(local_id)
        .bind(PendingSaleStatus::Confirmed)
        .bind(server_id)
        .bind(Utc::now())
        .bind(PendingSaleStatus::Submitting)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(local_id, PendingSaleStatus::Submitting, row)
            .await
    }

    /// Submitting → Rejected (terminal until acknowledged).
    pub async fn mark_rejected(&self, local_id: &str, reason: &str) -> DbResult<PendingSale> {
        self.finish_attempt(local_id, PendingSaleStatus::Rejected, reason)
            .await
    }

    /// Submitting → Queued after a transient failure.
    pub async fn mark_retry(&self, local_id: &str, error: &str) -> DbResult<PendingSale> {
        self.finish_attempt(local_id, PendingSaleStatus::Queued, error)
            .await
    }

    async fn finish_attempt(
        &self,
        local_id: &str,
        next: PendingSaleStatus,
        error: &str,
    ) -> DbResult<PendingSale> {
        let row = sqlx::query_as::<_, PendingSaleRow>(
            r#"
            UPDATE pending_sales SET
                status = ?2,
                attempts = attempts + 1,
                last_error = ?3,
                updated_at = ?4
            WHERE local_id = ?1 AND status = ?5
            RETURNING *
            "#,
        )
        .bind(local_id)
        .bind(next)
        .bind(error)
        .bind(Utc::now())
        .bind(PendingSaleStatus::Submitting)
        .fetch_optional(&self.pool)
        .await?;

        self.transitioned(local_id, PendingSaleStatus::Submitting, row)
            .await
    }

    /// Deletes a Confirmed sale. Any other status is an InvalidTransition.
    pub async fn delete_confirmed(&self, local_id: &str) -> DbResult<()> {
        self.delete_in_status(local_id, PendingSaleStatus::Confirmed)
            .await
    }

    /// Deletes a Rejected sale after operator acknowledgement.
    pub async fn delete_rejected(&self, local_id: &str) -> DbResult<()> {
        self.delete_in_status(local_id, PendingSaleStatus::Rejected)
            .await
    }

    async fn delete_in_status(&self, local_id: &str, expected: PendingSaleStatus) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM pending_sales WHERE local_id = ?1 AND status = ?2")
            .bind(local_id)
            .bind(expected)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(local_id, expected).await);
        }

        debug!(local_id = %local_id, status = %expected, "Removed pending sale");
        Ok(())
    }

    async fn transitioned(
        &self,
        local_id: &str,
        expected: PendingSaleStatus,
        row: Option<PendingSaleRow>,
    ) -> DbResult<PendingSale> {
        match row {
            Some(row) => {
                let sale = PendingSale::from(row);
                debug!(
                    local_id = %local_id,
                    status = %sale.status,
                    attempts = sale.attempts,
                    "Pending sale transitioned"
                );
                Ok(sale)
            }
            None => Err(self.explain_miss(local_id, expected).await),
        }
    }

    /// Works out why a guarded statement matched no row.
    async fn explain_miss(&self, local_id: &str, expected: PendingSaleStatus) -> DbError {
        match self.get(local_id).await {
            Ok(Some(sale)) => DbError::invalid_transition(local_id, expected, sale.status),
            Ok(None) => DbError::not_found("PendingSale", local_id),
            Err(e) => e,
        }
    }

    // =========================================================================
    // Counts & Recovery
    // =========================================================================

    /// Counts Queued + Submitting sales.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_sales WHERE status IN (?1, ?2)")
                .bind(PendingSaleStatus::Queued)
                .bind(PendingSaleStatus::Submitting)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Counts Rejected sales awaiting acknowledgement.
    pub async fn count_rejected(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_sales WHERE status = ?1")
            .bind(PendingSaleStatus::Rejected)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Returns Submitting leftovers (from a crash or an aborted drain) to
    /// Queued. Attempts are left untouched: the interrupted attempt never
    /// completed.
    ///
    /// ## Returns
    /// Number of requeued sales.
    pub async fn recover_interrupted(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_sales SET status = ?1, updated_at = ?2 WHERE status = ?3",
        )
        .bind(PendingSaleStatus::Queued)
        .bind(Utc::now())
        .bind(PendingSaleStatus::Submitting)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes Confirmed leftovers (crash between confirm and remove).
    ///
    /// ## Returns
    /// Number of deleted sales.
    pub async fn purge_confirmed(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM pending_sales WHERE status = ?1")
            .bind(PendingSaleStatus::Confirmed)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
