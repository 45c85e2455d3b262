//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_SERVER_URL=https://pos.example.com                           │
//! │     TALLY_DEVICE_ID=register-1                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     5 attempts, 500ms backoff, 3s debounce, auto-generated device id   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [server]
//! base_url = "https://pos.example.com"
//! api_key = "secret"
//! request_timeout_secs = 15
//!
//! [sync]
//! max_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_secs = 30
//! sync_interval_secs = 300
//!
//! [connectivity]
//! debounce_ms = 3000
//! probe_interval_secs = 15
//!
//! [cache]
//! lookup_limit = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier, stamped on every queued sale.
    /// Generated and written back to the config file on first run.
    #[serde(default = "generate_device_id")]
    pub id: String,

    /// Human-readable device name (e.g., "Register 1").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: generate_device_id(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Transaction server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the transaction server (http or https).
    /// Without it the terminal records sales but never drains.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout (seconds). Bounds how long one submission can hang.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Drain and retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Submission attempts per item within one drain before it is left
    /// queued for the next trigger.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Backoff cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Periodic drain interval (seconds). 0 disables the timer.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// How long Success/Error stays visible before returning to Idle
    /// (milliseconds).
    #[serde(default = "default_result_display")]
    pub result_display_ms: u64,

    /// Refresh the catalog cache after a drain that left nothing queued.
    #[serde(default = "default_true")]
    pub refresh_cache_after_sync: bool,

    /// Start a drain right after an enqueue while online.
    #[serde(default = "default_true")]
    pub submit_on_enqueue: bool,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    30
}
fn default_sync_interval() -> u64 {
    300
}
fn default_result_display() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_multiplier(),
            max_backoff_secs: default_max_backoff(),
            sync_interval_secs: default_sync_interval(),
            result_display_ms: default_result_display(),
            refresh_cache_after_sync: true,
            submit_on_enqueue: true,
        }
    }
}

// =============================================================================
// Connectivity Settings
// =============================================================================

/// Connectivity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    /// A raw state must persist this long before it becomes the stable
    /// state (milliseconds).
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Reachability probe interval (seconds).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Whether the engine probes the server itself. Disable when the host
    /// application reports connectivity through `report_connectivity`.
    #[serde(default = "default_true")]
    pub probe_enabled: bool,
}

fn default_debounce() -> u64 {
    3000
}
fn default_probe_interval() -> u64 {
    15
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            debounce_ms: default_debounce(),
            probe_interval_secs: default_probe_interval(),
            probe_enabled: true,
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Offline catalog cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum rows per kind returned by a lookup.
    #[serde(default = "default_lookup_limit")]
    pub lookup_limit: u32,
}

fn default_lookup_limit() -> u32 {
    tally_db::repository::catalog::DEFAULT_LOOKUP_LIMIT
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            lookup_limit: default_lookup_limit(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

impl SyncConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    ///
    /// When the file is missing or has no `[device] id`, the generated ID
    /// is written back so the terminal keeps the same identity across
    /// restarts. Environment overrides are never persisted.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = match config_path.or_else(Self::default_config_path) {
            Some(path) => Self::load_file(&path)?,
            None => {
                warn!("No config directory available; device ID will change on restart");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn load_file(path: &Path) -> SyncResult<Self> {
        let (config, has_device_id) = if path.exists() {
            info!(?path, "Loading sync config from file");
            let contents = std::fs::read_to_string(path)?;
            let table: toml::Table = contents.parse()?;
            let has_device_id = table
                .get("device")
                .and_then(|device| device.get("id"))
                .is_some();
            (toml::Value::Table(table).try_into::<SyncConfig>()?, has_device_id)
        } else {
            debug!(?path, "Config file not found, using defaults");
            (Self::default(), false)
        };

        if !has_device_id {
            match config.save(Some(path.to_path_buf())) {
                Ok(()) => info!(device_id = %config.device.id, "Generated device ID persisted"),
                Err(e) => warn!(error = %e, "Could not persist generated device ID"),
            }
        }

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(ref raw) = self.server.base_url {
            let parsed = url::Url::parse(raw)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "Server URL must start with http:// or https://, got: {}",
                    raw
                )));
            }
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        // Written negated so NaN is rejected too
        if !(self.sync.backoff_multiplier >= 1.0) {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }

        if self.initial_backoff() > self.max_backoff() {
            return Err(SyncError::InvalidConfig(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_secs ({})",
                self.sync.initial_backoff_ms, self.sync.max_backoff_secs
            )));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.connectivity.probe_enabled && self.connectivity.probe_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "probe_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(url) = lookup("TALLY_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.base_url = Some(url);
        }

        if let Some(key) = lookup("TALLY_API_KEY") {
            self.server.api_key = Some(key);
        }

        if let Some(raw) = lookup("TALLY_MAX_ATTEMPTS") {
            match raw.parse::<u32>() {
                Ok(n) => self.sync.max_attempts = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_MAX_ATTEMPTS"),
            }
        }

        if let Some(raw) = lookup("TALLY_SYNC_INTERVAL_SECS") {
            match raw.parse::<u64>() {
                Ok(n) => self.sync.sync_interval_secs = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_SYNC_INTERVAL_SECS"),
            }
        }

        if let Some(raw) = lookup("TALLY_DEBOUNCE_MS") {
            match raw.parse::<u64>() {
                Ok(n) => self.connectivity.debounce_ms = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_DEBOUNCE_MS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the default SQLite database path.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.data_dir().join("tally.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server.base_url.as_deref()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.sync.max_backoff_secs)
    }

    /// `None` when the periodic timer is disabled.
    pub fn sync_interval(&self) -> Option<Duration> {
        match self.sync.sync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn result_display(&self) -> Duration {
        Duration::from_millis(self.sync.result_display_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.connectivity.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.probe_interval_secs)
    }
}
