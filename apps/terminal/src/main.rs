//! # Tally Terminal
//!
//! Headless daemon running the sale sync engine on a checkout terminal.
//!
//! ## Startup
//! ```text
//!   load sync.toml (+ TALLY_* env)
//!        │
//!        ▼
//!   open tally.db ──► SyncEngine::start ──► log state & outcomes
//!        │                                         │
//!        └──────────── Ctrl+C / SIGTERM ◄──────────┘
//!                            │
//!                            ▼
//!                engine.shutdown() ──► db.close()
//! ```
//!
//! ## Environment
//! - `TALLY_CONFIG` - Config file path (default: platform config dir)
//! - `TALLY_DB_PATH` - Database file path (default: platform data dir)
//! - `RUST_LOG` - Log filter (default: `info,tally=debug,sqlx=warn`)

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally_core::SaleOutcome;
use tally_db::{Database, DbConfig};
use tally_sync::{HttpRemote, SyncConfig, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Tally terminal sync daemon...");

    let config_path = std::env::var("TALLY_CONFIG").ok().map(PathBuf::from);
    let config = SyncConfig::load(config_path)?;
    info!(
        device_id = %config.device_id(),
        server = config.server_url().unwrap_or("<unset>"),
        "Configuration loaded"
    );

    let db_path = get_database_path()?;
    let db = Database::new(DbConfig::new(&db_path)).await?;
    info!(path = %db_path.display(), "Database opened");

    let remote = Arc::new(HttpRemote::new(&config)?);
    let engine = SyncEngine::start(config, db.clone(), remote).await?;

    let _state_log = engine.subscribe(|state| {
        info!(
            status = ?state.status,
            connection = ?state.connection_status,
            pending = state.pending_count,
            rejected = state.rejected_count,
            last_error = state.last_error.as_deref().unwrap_or(""),
            "Sync state"
        );
    });

    let mut outcomes = engine.outcomes();
    let outcome_log = tokio::spawn(async move {
        loop {
            match outcomes.recv().await {
                Ok(SaleOutcome::Confirmed(sale)) => {
                    info!(
                        local_id = %sale.local_id,
                        server_id = sale.server_id.as_deref().unwrap_or(""),
                        "Sale confirmed"
                    );
                }
                Ok(SaleOutcome::Rejected(sale)) => {
                    warn!(
                        local_id = %sale.local_id,
                        reason = sale.last_error.as_deref().unwrap_or(""),
                        "Sale rejected, needs operator review"
                    );
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Outcome log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;

    engine.shutdown().await;
    outcome_log.abort();
    db.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves the database file, creating its directory if needed.
///
/// `TALLY_DB_PATH` overrides the platform data directory.
fn get_database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = match std::env::var("TALLY_DB_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => SyncConfig::default_database_path()
            .ok_or("Could not determine app data directory")?,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    Ok(path)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping sync engine...");
}
