//! # Domain Types
//!
//! Core domain types used by the offline sale sync engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  SalePayload    │   │  PendingSale    │   │   SyncState     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  lines          │◄──│  local_id       │   │  status         │       │
//! │  │  payment_method │   │  server_id      │   │  connection     │       │
//! │  │  totals (cents) │   │  status         │   │  pending_count  │       │
//! │  │  sold_at        │   │  attempts       │   │  last_sync_time │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  PendingSaleStatus lifecycle:                                          │
//! │                                                                         │
//! │     Queued ──► Submitting ──┬──► Confirmed   (terminal)                │
//! │       ▲                     ├──► Rejected    (terminal)                │
//! │       └──── retry ──────────┘                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Payment Method
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Physical cash payment.
    Cash,
    /// Card payment on an external terminal.
    Card,
    /// Vouchers, store credit and anything else.
    Other,
}

// =============================================================================
// Sale Payload
// =============================================================================

/// A line of a recorded sale.
///
/// Uses the snapshot pattern: sku, name and price are frozen at the time of
/// sale so the payload stays valid even if the catalog changes before sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub product_id: String,
    /// SKU at time of sale (frozen).
    pub sku: String,
    /// Product name at time of sale (frozen).
    pub name: String,
    /// Unit price in cents at time of sale (frozen).
    pub unit_price_cents: i64,
    pub quantity: i64,
    /// Discount applied to this line.
    #[serde(default)]
    pub discount_cents: i64,
}

impl SaleLine {
    /// Line total before sale-level discount and tax (unit × qty − discount).
    #[inline]
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity - self.discount_cents
    }
}

/// The full data of one sale completed at the terminal.
///
/// Immutable once handed to the queue. The sync engine never inspects it
/// beyond validation; it is forwarded verbatim to the remote create-sale
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SalePayload {
    pub lines: Vec<SaleLine>,
    pub payment_method: PaymentMethod,
    /// What the customer handed over.
    pub amount_paid_cents: i64,
    pub subtotal_cents: i64,
    /// Sale-level discount.
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default)]
    pub tax_cents: i64,
    pub total_cents: i64,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub cashier_id: String,
    pub device_id: String,
    #[ts(as = "String")]
    pub sold_at: DateTime<Utc>,
}

impl SalePayload {
    /// Sum of line totals.
    pub fn computed_subtotal_cents(&self) -> i64 {
        self.lines.iter().map(SaleLine::line_total_cents).sum()
    }

    /// subtotal − discount + tax.
    pub fn computed_total_cents(&self) -> i64 {
        self.subtotal_cents - self.discount_cents + self.tax_cents
    }

    /// Change returned to the customer.
    pub fn change_due_cents(&self) -> i64 {
        (self.amount_paid_cents - self.total_cents).max(0)
    }
}

// =============================================================================
// Pending Sale
// =============================================================================

/// Lifecycle status of a queued sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PendingSaleStatus {
    /// Waiting for the next drain.
    Queued,
    /// A submission attempt is in flight.
    Submitting,
    /// Accepted by the server.
    Confirmed,
    /// Refused by the server (validation). Kept for audit until acknowledged.
    Rejected,
}

impl PendingSaleStatus {
    /// Confirmed and Rejected never transition again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingSaleStatus::Confirmed | PendingSaleStatus::Rejected)
    }

    /// Counted in `SyncState::pending_count`.
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, PendingSaleStatus::Queued | PendingSaleStatus::Submitting)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PendingSaleStatus) -> bool {
        use PendingSaleStatus::*;
        matches!(
            (self, next),
            (Queued, Submitting)
                | (Submitting, Confirmed)
                | (Submitting, Rejected)
                | (Submitting, Queued)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingSaleStatus::Queued => "queued",
            PendingSaleStatus::Submitting => "submitting",
            PendingSaleStatus::Confirmed => "confirmed",
            PendingSaleStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PendingSaleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sale awaiting confirmation from the transaction server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PendingSale {
    /// Client-generated UUID v4. Sent as the idempotency key on every attempt.
    pub local_id: String,
    /// Assigned by the server once accepted.
    pub server_id: Option<String>,
    pub payload: SalePayload,
    pub status: PendingSaleStatus,
    /// Completed submission attempts (retries, confirmation and rejection).
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Local wall-clock time of enqueue. Drain order key.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Final result of a sale, published once per terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "outcome", content = "sale", rename_all = "snake_case")]
pub enum SaleOutcome {
    Confirmed(PendingSale),
    Rejected(PendingSale),
}

impl SaleOutcome {
    pub fn sale(&self) -> &PendingSale {
        match self {
            SaleOutcome::Confirmed(sale) | SaleOutcome::Rejected(sale) => sale,
        }
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Engine-level status shown by the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No drain running.
    #[default]
    Idle,
    /// A drain is in progress.
    Syncing,
    /// Last drain finished with nothing left queued.
    Success,
    /// Last drain left at least one sale queued, or hit a storage failure.
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Debounced reachability of the transaction server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    #[default]
    Offline,
}

impl ConnectionStatus {
    #[inline]
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Online => write!(f, "online"),
            ConnectionStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Immutable snapshot of the engine delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub connection_status: ConnectionStatus,
    /// Queued + Submitting sales.
    pub pending_count: i64,
    /// Rejected sales still waiting for operator acknowledgement.
    pub rejected_count: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Point-in-time diagnostics returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiagnostics {
    pub status: SyncStatus,
    pub connection_status: ConnectionStatus,
    /// Queue length (pending items only).
    pub pending_count: i64,
    pub rejected_count: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cached_products: i64,
    pub cached_customers: i64,
    #[ts(as = "Option<String>")]
    pub catalog_fetched_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn line(price: i64, qty: i64, discount: i64) -> SaleLine {
        SaleLine {
            product_id: "p-1".to_string(),
            sku: "COKE-330".to_string(),
            name: "Coca-Cola 330ml".to_string(),
            unit_price_cents: price,
            quantity: qty,
            discount_cents: discount,
        }
    }

    #[test]
    fn test_line_total() {
        assert_eq!(line(250, 3, 50).line_total_cents(), 700);
    }

    #[test]
    fn test_status_transitions() {
        use PendingSaleStatus::*;
        assert!(Queued.can_transition_to(Submitting));
        assert!(Submitting.can_transition_to(Queued));
        assert!(Submitting.can_transition_to(Confirmed));
        assert!(Submitting.can_transition_to(Rejected));
        assert!(!Queued.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Queued));
        assert!(!Rejected.can_transition_to(Submitting));
    }

    #[test]
    fn test_terminal_and_pending() {
        assert!(PendingSaleStatus::Confirmed.is_terminal());
        assert!(PendingSaleStatus::Rejected.is_terminal());
        assert!(!PendingSaleStatus::Submitting.is_terminal());
        assert!(PendingSaleStatus::Submitting.is_pending());
        assert!(!PendingSaleStatus::Rejected.is_pending());
    }

    #[test]
    fn test_sync_state_default() {
        let state = SyncState::default();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.connection_status, ConnectionStatus::Offline);
        assert_eq!(state.pending_count, 0);
    }

    #[test]
    fn test_sync_state_serializes_camel_case() {
        let json = serde_json::to_value(SyncState::default()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["connectionStatus"], "offline");
        assert!(json.get("pendingCount").is_some());
    }

    #[test]
    fn test_outcome_tagging() {
        let payload = SalePayload {
            lines: vec![line(100, 1, 0)],
            payment_method: PaymentMethod::Cash,
            amount_paid_cents: 100,
            subtotal_cents: 100,
            discount_cents: 0,
            tax_cents: 0,
            total_cents: 100,
            customer_id: None,
            cashier_id: "u-1".to_string(),
            device_id: "d-1".to_string(),
            sold_at: Utc::now(),
        };
        let sale = PendingSale {
            local_id: "abc".to_string(),
            server_id: Some("srv-1".to_string()),
            payload,
            status: PendingSaleStatus::Confirmed,
            attempts: 1,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(SaleOutcome::Confirmed(sale)).unwrap();
        assert_eq!(json["outcome"], "confirmed");
        assert_eq!(json["sale"]["local_id"], "abc");
    }
}
