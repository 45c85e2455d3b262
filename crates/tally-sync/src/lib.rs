//! # tally-sync: Offline-Tolerant Sale Sync Engine
//!
//! Every sale recorded at the checkout is written to a durable local queue
//! first and delivered to the transaction server later. The cashier never
//! waits on the network.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Tally POS Terminal                              │
//! │                                                                         │
//! │  checkout ──► enqueue_sale ──► ┌──────────────┐                         │
//! │                                │  SaleQueue   │  (tally-db, SQLite)     │
//! │                                └──────┬───────┘                         │
//! │                                       │ peek_ordered                    │
//! │  ┌──────────────┐  restored  ┌────────▼─────────┐  create_sale  ┌─────┐ │
//! │  │ Connectivity │───────────►│ SyncOrchestrator │──────────────►│ API │ │
//! │  │   Monitor    │            │ (single drain)   │◄──────────────│     │ │
//! │  └──────▲───────┘            └────────┬─────────┘   accepted    └─────┘ │
//! │         │ probe / report              │ update                          │
//! │                              ┌────────▼─────────┐                       │
//! │  status indicator ◄──────────│  StateNotifier   │                       │
//! │                              └──────────────────┘                       │
//! │                                                                         │
//! │  product search ──► CacheRefresher.lookup (local snapshot only)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - Composition root owning every component and background task
//! - [`queue`] - Durable ordered queue of pending sales
//! - [`orchestrator`] - Drain loop with retry, backoff, and single-flight guard
//! - [`connectivity`] - Debounced online/offline detection
//! - [`notifier`] - Observable sync state with ordered delivery
//! - [`remote`] - Transaction server client traits and the HTTP implementation
//! - [`cache`] - Read-only catalog snapshot for offline lookups
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Error types and remote failure classification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{HttpRemote, SyncConfig, SyncEngine};
//! use tally_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let db = Database::new(DbConfig::new("tally.db")).await?;
//! let remote = std::sync::Arc::new(HttpRemote::new(&config)?);
//!
//! let engine = SyncEngine::start(config, db, remote).await?;
//! let _sub = engine.subscribe(|state| println!("{:?}", state.status));
//!
//! let local_id = engine.enqueue_sale(payload).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod queue;
pub mod remote;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::CacheRefresher;
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use engine::SyncEngine;
pub use error::{RemoteError, RemoteErrorKind, SyncError, SyncResult};
pub use notifier::{StateNotifier, Subscription};
pub use orchestrator::{DrainOutcome, DrainReport, RetryPolicy, SyncOrchestrator, SyncTrigger};
pub use queue::SaleQueue;
pub use remote::{CatalogRemote, HttpRemote, ReachabilityProbe, SaleAccepted, SaleRemote};
