//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Local       │  │       Remote            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Validation     │  │  RemoteError            │ │
//! │  │  MissingDeviceId│  │  Storage        │  │  ├── Transient → retry  │ │
//! │  │  InvalidUrl     │  │                 │  │  └── Permanent → reject │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Remote errors never escape a drain: they become item transitions.    │
//! │  Storage errors fail the operation (enqueue → Err, drain → Error).    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Remote Error
// =============================================================================

/// How the orchestrator should treat a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network failure, timeout, 5xx, 408/425/429. Retry with backoff.
    Transient,
    /// Server refused the request (validation). Never retried.
    Permanent,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteErrorKind::Transient => write!(f, "transient"),
            RemoteErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a call to the transaction server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    /// HTTP status, when the server answered at all.
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError {
            kind: RemoteErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError {
            kind: RemoteErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    /// Builds an error from an HTTP status, classifying it.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", body.trim())
        };

        RemoteError {
            kind: classify_status(status),
            status: Some(status),
            message,
        }
    }

    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

/// Maps an HTTP status to a retry class.
///
/// ```text
/// 408 Request Timeout      ─┐
/// 425 Too Early             │
/// 429 Too Many Requests     ├──► Transient
/// 5xx                      ─┘
/// other 4xx                ───► Permanent
/// ```
pub fn classify_status(status: u16) -> RemoteErrorKind {
    match status {
        408 | 425 | 429 => RemoteErrorKind::Transient,
        s if s >= 500 => RemoteErrorKind::Transient,
        s if (400..500).contains(&s) => RemoteErrorKind::Permanent,
        // 1xx/3xx reaching us means the server misbehaved; try again later.
        _ => RemoteErrorKind::Transient,
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all failures surfaced to callers.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required on every sale).
    #[error("Device ID not configured. Set [device] id or TALLY_DEVICE_ID.")]
    MissingDeviceId,

    /// Invalid server URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Sale payload failed validation; nothing was written.
    #[error("Invalid sale: {0}")]
    Validation(#[from] tally_core::CoreError),

    /// Sale was recorded for a different terminal.
    #[error("Sale belongs to device {found}, this terminal is {expected}")]
    DeviceMismatch { expected: String, found: String },

    /// Durable local store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] tally_db::DbError),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Transaction server call failed.
    #[error("Remote error ({}): {0}", .0.kind)]
    Remote(#[from] RemoteError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Background task channel closed or task failed to join.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the failed operation can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Storage(tally_db::DbError::PoolExhausted) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(500), RemoteErrorKind::Transient);
        assert_eq!(classify_status(503), RemoteErrorKind::Transient);
        assert_eq!(classify_status(408), RemoteErrorKind::Transient);
        assert_eq!(classify_status(429), RemoteErrorKind::Transient);
        assert_eq!(classify_status(400), RemoteErrorKind::Permanent);
        assert_eq!(classify_status(409), RemoteErrorKind::Permanent);
        assert_eq!(classify_status(422), RemoteErrorKind::Permanent);
    }

    #[test]
    fn test_from_status_message() {
        let err = RemoteError::from_status(422, " unknown sku ");
        assert_eq!(err.to_string(), "HTTP 422: unknown sku");
        assert!(!err.is_retryable());

        let err = RemoteError::from_status(502, "");
        assert_eq!(err.to_string(), "HTTP 502");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Remote(RemoteError::transient("timeout")).is_retryable());
        assert!(!SyncError::Remote(RemoteError::permanent("bad sale")).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(SyncError::MissingDeviceId.is_config_error());
    }

    #[test]
    fn test_remote_display_includes_kind() {
        let err = SyncError::Remote(RemoteError::from_status(503, "maintenance"));
        assert_eq!(
            err.to_string(),
            "Remote error (transient): HTTP 503: maintenance"
        );
    }
}
