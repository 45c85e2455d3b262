//! # Validation Module
//!
//! Sale payload validation, run before a sale is handed to the queue.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Checkout UI                                                  │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: enqueue_sale (Rust)                                          │
//! │  └── THIS MODULE: lines, prices, totals, payment                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Transaction server                                           │
//! │  └── Authoritative checks (422 → Rejected)                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A sale that passes here can still be rejected by the server; that path
//! goes through the queue's Rejected state instead of an error return.
//!
//! ## Usage
//! ```rust,no_run
//! use tally_core::validation::{validate_quantity, validate_local_id};
//!
//! validate_quantity(5).unwrap();
//! validate_local_id("550e8400-e29b-41d4-a716-446655440000").unwrap();
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{SaleLine, SalePayload};
use crate::{MAX_LINE_QUANTITY, MAX_SALE_LINES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Sale Payload
// =============================================================================

/// Validates a complete sale before it is queued.
///
/// ## Rules
/// - At least one line, at most `MAX_SALE_LINES`
/// - Every line: positive quantity, non-negative price and discount
/// - `subtotal_cents` = Σ (unit × qty − line discount)
/// - `total_cents` = subtotal − discount + tax
/// - `amount_paid_cents` ≥ `total_cents`
/// - `cashier_id` and `device_id` are present
///
/// ## Flow
/// ```text
/// enqueue_sale(payload)
///      │
///      ▼
/// validate_sale_payload ← THIS FUNCTION
///      │
///      ├── Err → caller shows error, nothing written
///      │
///      └── Ok  → single INSERT as Queued
/// ```
pub fn validate_sale_payload(payload: &SalePayload) -> CoreResult<()> {
    if payload.lines.is_empty() {
        return Err(CoreError::EmptySale);
    }
    if payload.lines.len() > MAX_SALE_LINES {
        return Err(CoreError::TooManyLines {
            max: MAX_SALE_LINES,
        });
    }

    for line in &payload.lines {
        validate_line(line)?;
    }

    validate_required("cashier_id", &payload.cashier_id)?;
    validate_required("device_id", &payload.device_id)?;
    validate_non_negative("discount_cents", payload.discount_cents)?;
    validate_non_negative("tax_cents", payload.tax_cents)?;
    validate_non_negative("amount_paid_cents", payload.amount_paid_cents)?;

    let expected_subtotal = payload.computed_subtotal_cents();
    if payload.subtotal_cents != expected_subtotal {
        return Err(CoreError::TotalMismatch {
            field: "subtotal".to_string(),
            expected: expected_subtotal,
            actual: payload.subtotal_cents,
        });
    }

    let expected_total = payload.computed_total_cents();
    if payload.total_cents != expected_total {
        return Err(CoreError::TotalMismatch {
            field: "total".to_string(),
            expected: expected_total,
            actual: payload.total_cents,
        });
    }

    if payload.total_cents < 0 {
        return Err(ValidationError::Negative {
            field: "total_cents".to_string(),
        }
        .into());
    }

    if payload.amount_paid_cents < payload.total_cents {
        return Err(CoreError::InsufficientPayment {
            paid: payload.amount_paid_cents,
            total: payload.total_cents,
        });
    }

    Ok(())
}

/// Validates a single sale line.
pub fn validate_line(line: &SaleLine) -> ValidationResult<()> {
    validate_required("product_id", &line.product_id)?;
    validate_quantity(line.quantity)?;
    validate_price_cents(line.unit_price_cents)?;
    validate_non_negative("discount_cents", line.discount_cents)?;

    if line.discount_cents > line.unit_price_cents * line.quantity {
        return Err(ValidationError::OutOfRange {
            field: "discount_cents".to_string(),
            min: 0,
            max: line.unit_price_cents * line.quantity,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity value.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_LINE_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_LINE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a price in cents. Zero is allowed (free items).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    validate_non_negative("unit_price_cents", cents)
}

fn validate_non_negative(field: &str, value: i64) -> ValidationResult<()> {
    if value < 0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn validate_required(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }
    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a local sale id (UUID format).
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_local_id;
///
/// assert!(validate_local_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_local_id("not-a-uuid").is_err());
/// ```
pub fn validate_local_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "local_id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "local_id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
