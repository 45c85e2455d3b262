//! # Pending Sale Queue
//!
//! The durable, ordered queue of sales awaiting server confirmation.
//!
//! ## Item Lifecycle
//! ```text
//!   enqueue()
//!      │
//!      ▼
//!  ┌────────┐ mark_submitting ┌────────────┐ mark_confirmed ┌───────────┐
//!  │ Queued │────────────────►│ Submitting │───────────────►│ Confirmed │──► remove()
//!  └────────┘                 └────────────┘                └───────────┘
//!      ▲                         │      │
//!      │        mark_retry       │      │ mark_rejected     ┌───────────┐
//!      └─────────────────────────┘      └──────────────────►│ Rejected  │──► acknowledge_rejected()
//!                                                           └───────────┘
//! ```
//!
//! `enqueue` is the checkout path: it validates, writes once, and never
//! touches the network.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncResult;
use tally_core::validation::{validate_local_id, validate_sale_payload};
use tally_core::{CoreError, PendingSale, SalePayload};
use tally_db::{Database, PendingSaleRepository};

/// Queue operations over the durable local store.
#[derive(Debug, Clone)]
pub struct SaleQueue {
    repo: PendingSaleRepository,
}

impl SaleQueue {
    pub fn new(db: &Database) -> Self {
        SaleQueue {
            repo: db.pending_sales(),
        }
    }

    /// Validates and durably records a completed sale.
    ///
    /// ## Returns
    /// * `Ok(local_id)` - The sale is on disk as Queued
    /// * `Err(SyncError::Validation)` - Payload rejected, nothing written
    /// * `Err(SyncError::Storage)` - Write failed, the sale is NOT recorded
    pub async fn enqueue(&self, payload: SalePayload) -> SyncResult<String> {
        validate_sale_payload(&payload)?;

        let local_id = Uuid::new_v4().to_string();
        self.repo.insert(&local_id, &payload, Utc::now()).await?;

        info!(
            local_id = %local_id,
            total_cents = payload.total_cents,
            "Sale queued"
        );
        Ok(local_id)
    }

    /// Queued and Submitting items in drain order.
    pub async fn peek_ordered(&self) -> SyncResult<Vec<PendingSale>> {
        Ok(self.repo.list_pending().await?)
    }

    pub async fn get(&self, local_id: &str) -> SyncResult<Option<PendingSale>> {
        Ok(self.repo.get(local_id).await?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub async fn mark_submitting(&self, local_id: &str) -> SyncResult<PendingSale> {
        Ok(self.repo.mark_submitting(local_id).await?)
    }

    pub async fn mark_confirmed(&self, local_id: &str, server_id: &str) -> SyncResult<PendingSale> {
        Ok(self.repo.mark_confirmed(local_id, server_id).await?)
    }

    pub async fn mark_rejected(&self, local_id: &str, reason: &str) -> SyncResult<PendingSale> {
        Ok(self.repo.mark_rejected(local_id, reason).await?)
    }

    pub async fn mark_retry(&self, local_id: &str, error: &str) -> SyncResult<PendingSale> {
        Ok(self.repo.mark_retry(local_id, error).await?)
    }

    /// Deletes a Confirmed item. Any other status is an error.
    pub async fn remove(&self, local_id: &str) -> SyncResult<()> {
        self.repo.delete_confirmed(local_id).await?;
        debug!(local_id = %local_id, "Confirmed sale removed from queue");
        Ok(())
    }

    // =========================================================================
    // Rejected Items
    // =========================================================================

    pub async fn list_rejected(&self) -> SyncResult<Vec<PendingSale>> {
        Ok(self.repo.list_rejected().await?)
    }

    /// Operator acknowledgement: deletes a Rejected item.
    ///
    /// The id comes from outside the engine, so it is checked first.
    pub async fn acknowledge_rejected(&self, local_id: &str) -> SyncResult<()> {
        validate_local_id(local_id).map_err(CoreError::from)?;
        self.repo.delete_rejected(local_id).await?;
        info!(local_id = %local_id, "Rejected sale acknowledged");
        Ok(())
    }

    // =========================================================================
    // Counts & Recovery
    // =========================================================================

    pub async fn count_pending(&self) -> SyncResult<i64> {
        Ok(self.repo.count_pending().await?)
    }

    pub async fn count_rejected(&self) -> SyncResult<i64> {
        Ok(self.repo.count_rejected().await?)
    }

    /// Returns Submitting leftovers of an interrupted drain to Queued.
    pub async fn recover_interrupted(&self) -> SyncResult<u64> {
        let n = self.repo.recover_interrupted().await?;
        if n > 0 {
            info!(count = n, "Requeued interrupted submissions");
        }
        Ok(n)
    }

    /// Deletes Confirmed leftovers (crash between confirm and remove).
    pub async fn purge_confirmed(&self) -> SyncResult<u64> {
        let n = self.repo.purge_confirmed().await?;
        if n > 0 {
            info!(count = n, "Purged confirmed leftovers");
        }
        Ok(n)
    }
}
