//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Sale payload rule violations                   │
//! │  └── ValidationError  - Field-level input failures                     │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  ├── RemoteError      - Transient / Permanent server failures          │
//! │  └── SyncError        - What engine callers see                        │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Sale payload rule violations.
///
/// Raised by [`crate::validation::validate_sale_payload`] before a sale is
/// written to the queue. A sale that fails here never becomes a
/// `PendingSale`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A sale must contain at least one line.
    #[error("Sale has no lines")]
    EmptySale,

    /// Sale has exceeded maximum allowed lines.
    #[error("Sale cannot have more than {max} lines")]
    TooManyLines { max: usize },

    /// Stored totals disagree with the lines.
    ///
    /// ## When This Occurs
    /// ```text
    /// lines: 2 × 250 + 1 × 100 = 600
    /// subtotal_cents: 650
    ///      │
    ///      ▼
    /// TotalMismatch { field: "subtotal", expected: 600, actual: 650 }
    /// ```
    #[error("{field} mismatch: expected {expected}, got {actual}")]
    TotalMismatch {
        field: String,
        expected: i64,
        actual: i64,
    },

    /// Customer handed over less than the total.
    #[error("Insufficient payment: paid {paid}, total {total}")]
    InsufficientPayment { paid: i64, total: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation of individual fields.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
