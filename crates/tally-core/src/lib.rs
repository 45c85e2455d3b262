//! # tally-core: Pure Types for the Tally POS Sync Engine
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace: the sale payload a cashier terminal records, the pending-sale
//! lifecycle, the sync state snapshot the UI observes, and the cached catalog
//! entities used for offline checkout.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Checkout UI / Status Indicator                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ subscribe / manual_sync               │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-sync (engine)                          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   error   │  │validation │  │  catalog  │  │   │
//! │  │   │SalePayload│  │ CoreError │  │  totals   │  │ snapshots │  │   │
//! │  │   │ SyncState │  │           │  │  limits   │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Durable Local Store)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Sale payload, pending sale lifecycle, sync state
//! - [`catalog`] - Read-only catalog entities cached for offline lookups
//! - [`error`] - Domain error types
//! - [`validation`] - Sale payload validation before it is queued
//!
//! ## Design Principles
//!
//! 1. **Integer Money**: All monetary values are in cents (i64)
//! 2. **Immutable payloads**: a recorded sale never changes after enqueue
//! 3. **Explicit Errors**: All errors are typed, never strings or panics

// =============================================================================
// Module Declarations
// =============================================================================

pub mod catalog;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use catalog::*;
pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum lines allowed in a single sale.
///
/// ## Business Reason
/// Prevents runaway payloads from clogging the offline queue.
pub const MAX_SALE_LINES: usize = 100;

/// Maximum quantity of a single line.
///
/// ## Business Reason
/// Prevents accidental over-ordering (e.g., typing 1000 instead of 10)
pub const MAX_LINE_QUANTITY: i64 = 999;
