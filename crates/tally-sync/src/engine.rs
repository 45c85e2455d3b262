//! # Sync Engine
//!
//! The facade the rest of the terminal talks to.
//!
//! ## Startup Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine::start()                             │
//! │                                                                         │
//! │  1. Validate config                                                    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  2. Crash recovery                                                     │
//! │     ├── Submitting leftovers → Queued                                  │
//! │     └── Confirmed leftovers  → deleted                                 │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  3. Initial SyncState from the store                                   │
//! │     (pending/rejected counts, last sync time, last error; Offline)     │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  4. Spawn background tasks                                             │
//! │     ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐    │
//! │     │ Connectivity     │ │ Periodic timer   │ │ Reachability     │    │
//! │     │ listener         │ │                  │ │ probe            │    │
//! │     │ stable Online →  │ │ every interval → │ │ probe() →        │    │
//! │     │ drain            │ │ drain            │ │ monitor.report() │    │
//! │     └──────────────────┘ └──────────────────┘ └──────────────────┘    │
//! │                                                                         │
//! │  All tasks stop on shutdown().                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let remote = Arc::new(HttpRemote::new(&config)?);
//! let engine = SyncEngine::start(config, db, remote).await?;
//!
//! let _sub = engine.subscribe(|state| println!("{} pending", state.pending_count));
//! let local_id = engine.enqueue_sale(payload).await?;
//! ```

use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheRefresher;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::notifier::{StateNotifier, Subscription};
use crate::orchestrator::{DrainOutcome, SyncOrchestrator, SyncTrigger};
use crate::queue::SaleQueue;
use crate::remote::{CatalogRemote, ReachabilityProbe, SaleRemote};
use tally_core::{
    CacheSummary, CatalogLookup, ConnectionStatus, PendingSale, SaleOutcome, SalePayload,
    SyncDiagnostics, SyncState, SyncStatus,
};
use tally_db::Database;

/// Running sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    queue: SaleQueue,
    orchestrator: Arc<SyncOrchestrator>,
    cache: CacheRefresher,
    connectivity: ConnectivityMonitor,
    notifier: StateNotifier,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Recovers the queue, builds the initial state and spawns the
    /// background tasks.
    ///
    /// ## Arguments
    /// * `config` - Validated here; an invalid config is an error
    /// * `db` - Open durable store
    /// * `remote` - Transaction server (create sale, catalog, probe)
    pub async fn start<R>(config: SyncConfig, db: Database, remote: Arc<R>) -> SyncResult<Self>
    where
        R: SaleRemote + CatalogRemote + ReachabilityProbe + 'static,
    {
        config.validate()?;
        info!(device_id = %config.device_id(), "Starting sync engine");

        let queue = SaleQueue::new(&db);
        queue.recover_interrupted().await?;
        queue.purge_confirmed().await?;

        let initial = Self::initial_state(&db, &queue).await?;
        info!(
            pending = initial.pending_count,
            rejected = initial.rejected_count,
            "Sync state restored"
        );

        let notifier = StateNotifier::new(initial);
        let connectivity = ConnectivityMonitor::new(config.debounce_window());

        let sale_remote: Arc<dyn SaleRemote> = remote.clone();
        let catalog_remote: Arc<dyn CatalogRemote> = remote.clone();
        let probe: Arc<dyn ReachabilityProbe> = remote;

        let cache = CacheRefresher::new(&db, catalog_remote, config.cache.lookup_limit);

        let mut orchestrator = SyncOrchestrator::new(
            &config,
            &db,
            sale_remote,
            connectivity.clone(),
            notifier.clone(),
        );
        if config.sync.refresh_cache_after_sync {
            orchestrator = orchestrator.with_cache_refresh(cache.clone());
        }
        let orchestrator = Arc::new(orchestrator);

        let (shutdown_tx, _) = watch::channel(false);

        let mut tasks = vec![Self::spawn_connectivity_listener(
            &connectivity,
            &notifier,
            &orchestrator,
            shutdown_tx.subscribe(),
        )];

        if let Some(period) = config.sync_interval() {
            tasks.push(Self::spawn_timer(
                period,
                &orchestrator,
                shutdown_tx.subscribe(),
            ));
        }

        if config.connectivity.probe_enabled {
            tasks.push(Self::spawn_probe(
                config.probe_interval(),
                probe,
                &connectivity,
                shutdown_tx.subscribe(),
            ));
        }

        info!(tasks = tasks.len(), "Sync engine started");

        Ok(SyncEngine {
            config,
            queue,
            orchestrator,
            cache,
            connectivity,
            notifier,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    async fn initial_state(db: &Database, queue: &SaleQueue) -> SyncResult<SyncState> {
        let meta = db.sync_meta();

        let last_sync_time = meta.last_sync_time().await.unwrap_or_else(|e| {
            warn!(?e, "Ignoring unreadable last sync time");
            None
        });

        Ok(SyncState {
            status: SyncStatus::Idle,
            connection_status: ConnectionStatus::Offline,
            pending_count: queue.count_pending().await?,
            rejected_count: queue.count_rejected().await?,
            last_sync_time,
            last_error: meta.last_error().await?,
        })
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    fn spawn_drain(orchestrator: &Arc<SyncOrchestrator>, trigger: SyncTrigger) {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move {
            let outcome = orchestrator.run_drain(trigger).await;
            debug!(trigger = %trigger, ?outcome, "Background drain finished");
        });
    }

    /// Mirrors stable connectivity into the state and drains on reconnect.
    fn spawn_connectivity_listener(
        connectivity: &ConnectivityMonitor,
        notifier: &StateNotifier,
        orchestrator: &Arc<SyncOrchestrator>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut status_rx = connectivity.watch();
        let notifier = notifier.clone();
        let orchestrator = Arc::clone(orchestrator);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *status_rx.borrow_and_update();
                        notifier.update(|s| s.connection_status = status);

                        if status.is_online() {
                            Self::spawn_drain(&orchestrator, SyncTrigger::ConnectivityRestored);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Connectivity listener stopped");
        })
    }

    fn spawn_timer(
        period: std::time::Duration,
        orchestrator: &Arc<SyncOrchestrator>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(orchestrator);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; startup is covered by
            // the connectivity listener.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let outcome = orchestrator.tick().await;
                        debug!(?outcome, "Periodic drain finished");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Sync timer stopped");
        })
    }

    fn spawn_probe(
        period: std::time::Duration,
        probe: Arc<dyn ReachabilityProbe>,
        connectivity: &ConnectivityMonitor,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let connectivity = connectivity.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reachable = probe.probe().await;
                        connectivity.report(if reachable {
                            ConnectionStatus::Online
                        } else {
                            ConnectionStatus::Offline
                        });
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Reachability probe stopped");
        })
    }

    // =========================================================================
    // Subscription API
    // =========================================================================

    /// Durably records a completed sale.
    ///
    /// Returns once the sale is on disk. Never waits on the network; when
    /// online a drain is started in the background.
    ///
    /// An empty `device_id` is stamped with this terminal's ID; a sale
    /// carrying another terminal's ID is refused.
    pub async fn enqueue_sale(&self, mut payload: SalePayload) -> SyncResult<String> {
        if *self.shutdown_tx.borrow() {
            return Err(SyncError::ShuttingDown);
        }

        let device_id = self.config.device_id();
        if payload.device_id.trim().is_empty() {
            payload.device_id = device_id.to_string();
        } else if payload.device_id != device_id {
            return Err(SyncError::DeviceMismatch {
                expected: device_id.to_string(),
                found: payload.device_id,
            });
        }

        let local_id = self.queue.enqueue(payload).await?;

        // The sale is durable; a failed count refresh must not fail checkout.
        if let Err(e) = self.orchestrator.publish_counts().await {
            warn!(?e, "Failed to publish pending count after enqueue");
        }

        if self.config.sync.submit_on_enqueue && self.connectivity.is_online() {
            Self::spawn_drain(&self.orchestrator, SyncTrigger::Enqueued);
        }

        Ok(local_id)
    }

    /// Registers a state handler; it is called immediately with the current
    /// state.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.notifier.subscribe(handler)
    }

    /// Drains now. A no-op while a drain is running or offline.
    pub async fn manual_sync(&self) -> DrainOutcome {
        self.orchestrator.manual_sync().await
    }

    pub async fn refresh_cache(&self) -> SyncResult<CacheSummary> {
        self.cache.refresh_all().await
    }

    /// Offline catalog search.
    pub async fn lookup(&self, query: &str) -> SyncResult<CatalogLookup> {
        self.cache.lookup(query).await
    }

    /// Read-only snapshot for a diagnostics screen.
    pub async fn get_diagnostics(&self) -> SyncResult<SyncDiagnostics> {
        let state = self.notifier.current();
        let cache = self.cache.snapshot_info().await?;

        Ok(SyncDiagnostics {
            status: state.status,
            connection_status: state.connection_status,
            pending_count: self.queue.count_pending().await?,
            rejected_count: self.queue.count_rejected().await?,
            last_sync_time: state.last_sync_time,
            last_error: state.last_error,
            cached_products: cache.products,
            cached_customers: cache.customers,
            catalog_fetched_at: cache.fetched_at,
        })
    }

    /// Sales the server refused, awaiting operator review.
    pub async fn rejected_sales(&self) -> SyncResult<Vec<PendingSale>> {
        self.queue.list_rejected().await
    }

    pub async fn acknowledge_rejected(&self, local_id: &str) -> SyncResult<()> {
        self.queue.acknowledge_rejected(local_id).await?;
        self.orchestrator.publish_counts().await
    }

    /// Feeds a raw connectivity observation from the host platform.
    pub fn report_connectivity(&self, status: ConnectionStatus) {
        self.connectivity.report(status);
    }

    pub fn outcomes(&self) -> broadcast::Receiver<SaleOutcome> {
        self.orchestrator.subscribe_outcomes()
    }

    pub fn state(&self) -> SyncState {
        self.notifier.current()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stops the background tasks and waits for them.
    ///
    /// A drain already in progress finishes its current item; no remote
    /// call is cancelled. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down sync engine");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(?e, "Sync task ended abnormally");
            }
        }

        info!("Sync engine stopped");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.config.device_id())
            .field("state", &self.notifier.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_payload, FakeServer};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tally_core::PendingSaleStatus;
    use tally_db::DbConfig;

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.device.id = "till-1".to_string();
        config.connectivity.debounce_ms = 0;
        config.connectivity.probe_enabled = false;
        config.sync.sync_interval_secs = 0;
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_secs = 1;
        config.sync.result_display_ms = 2000;
        config.sync.refresh_cache_after_sync = false;
        config.sync.submit_on_enqueue = false;
        config
    }

    async fn memory_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    /// Polls until `check` passes or two seconds elapse.
    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn record(engine: &SyncEngine) -> (Arc<StdMutex<Vec<SyncState>>>, Subscription) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = engine.subscribe(move |s| sink.lock().unwrap().push(s.clone()));
        (seen, sub)
    }

    #[tokio::test]
    async fn test_offline_sales_sync_on_reconnect() {
        let server = FakeServer::new();
        let engine = SyncEngine::start(test_config(), memory_db().await, server.clone())
            .await
            .unwrap();

        engine.enqueue_sale(sample_payload()).await.unwrap();
        engine.enqueue_sale(sample_payload()).await.unwrap();
        assert_eq!(engine.state().pending_count, 2);
        assert_eq!(engine.state().connection_status, ConnectionStatus::Offline);
        assert_eq!(engine.manual_sync().await, DrainOutcome::Offline);

        let (seen, _sub) = record(&engine);
        engine.report_connectivity(ConnectionStatus::Online);

        eventually(|| engine.state().status == SyncStatus::Success).await;

        let seen = seen.lock().unwrap();
        let syncing_counts: Vec<i64> = seen
            .iter()
            .filter(|s| s.status == SyncStatus::Syncing)
            .map(|s| s.pending_count)
            .collect();
        assert_eq!(syncing_counts, vec![2, 1, 0]);
        // Connectivity is published before the drain it triggers
        assert_eq!(seen[1].connection_status, ConnectionStatus::Online);
        assert_eq!(seen[1].status, SyncStatus::Idle);
        assert_eq!(server.created(), 2);

        drop(seen);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_flapping_connection_does_not_drain() {
        let mut config = test_config();
        config.connectivity.debounce_ms = 200;
        let server = FakeServer::new();
        let engine = SyncEngine::start(config, memory_db().await, server.clone())
            .await
            .unwrap();
        engine.enqueue_sale(sample_payload()).await.unwrap();

        engine.report_connectivity(ConnectionStatus::Online);
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.report_connectivity(ConnectionStatus::Offline);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(server.calls().is_empty());
        assert_eq!(engine.state().connection_status, ConnectionStatus::Offline);
        assert_eq!(engine.state().pending_count, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_survives_restart_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let server = FakeServer::new();

        let ids = {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let engine = SyncEngine::start(test_config(), db.clone(), server.clone())
                .await
                .unwrap();
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(engine.enqueue_sale(sample_payload()).await.unwrap());
            }
            engine.shutdown().await;
            db.close().await;
            ids
        };

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let engine = SyncEngine::start(test_config(), db, server.clone())
            .await
            .unwrap();
        assert_eq!(engine.state().pending_count, 3);

        engine.report_connectivity(ConnectionStatus::Online);
        eventually(|| engine.state().pending_count == 0).await;

        assert_eq!(server.calls(), ids);
        assert_eq!(server.created(), 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_requeues_interrupted_submission() {
        let db = memory_db().await;
        let queue = SaleQueue::new(&db);
        let id = queue.enqueue(sample_payload()).await.unwrap();
        queue.mark_submitting(&id).await.unwrap();
        db.sync_meta().set_last_error(Some("HTTP 502")).await.unwrap();

        let engine = SyncEngine::start(test_config(), db, FakeServer::new())
            .await
            .unwrap();

        let state = engine.state();
        assert_eq!(state.pending_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("HTTP 502"));
        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().status,
            PendingSaleStatus::Queued
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_while_online_submits() {
        let mut config = test_config();
        config.sync.submit_on_enqueue = true;
        let server = FakeServer::new();
        let engine = SyncEngine::start(config, memory_db().await, server.clone())
            .await
            .unwrap();
        engine.report_connectivity(ConnectionStatus::Online);
        eventually(|| engine.state().connection_status == ConnectionStatus::Online).await;

        let id = engine.enqueue_sale(sample_payload()).await.unwrap();

        eventually(|| server.created() == 1).await;
        assert_eq!(server.calls().last(), Some(&id));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_drives_connectivity() {
        let mut config = test_config();
        config.connectivity.probe_enabled = true;
        config.connectivity.probe_interval_secs = 1;
        let server = FakeServer::new();
        let engine = SyncEngine::start(config, memory_db().await, server.clone())
            .await
            .unwrap();

        // First probe runs immediately
        eventually(|| engine.state().connection_status == ConnectionStatus::Online).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_sale_lifecycle() {
        let server = FakeServer::new();
        let engine = SyncEngine::start(test_config(), memory_db().await, server.clone())
            .await
            .unwrap();
        let mut outcomes = engine.outcomes();
        let id = engine.enqueue_sale(sample_payload()).await.unwrap();
        server.reject(&id, "price changed");

        engine.report_connectivity(ConnectionStatus::Online);
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome, SaleOutcome::Rejected(ref s) if s.local_id == id));

        eventually(|| engine.state().rejected_count == 1).await;
        assert_eq!(engine.state().pending_count, 0);
        assert_eq!(engine.rejected_sales().await.unwrap()[0].local_id, id);

        engine.acknowledge_rejected(&id).await.unwrap();
        assert_eq!(engine.state().rejected_count, 0);
        assert!(engine.rejected_sales().await.unwrap().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_diagnostics_and_lookup() {
        let server = FakeServer::new();
        let engine = SyncEngine::start(test_config(), memory_db().await, server.clone())
            .await
            .unwrap();
        engine.enqueue_sale(sample_payload()).await.unwrap();
        engine.refresh_cache().await.unwrap();

        let diag = engine.get_diagnostics().await.unwrap();
        assert_eq!(diag.pending_count, 1);
        assert_eq!(diag.cached_products, 2);
        assert_eq!(diag.cached_customers, 1);
        assert!(diag.catalog_fetched_at.is_some());
        assert_eq!(diag.connection_status, ConnectionStatus::Offline);

        let found = engine.lookup("bread").await.unwrap();
        assert_eq!(found.products[0].entity.id, "p-2");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_stamps_device_id() {
        let engine = SyncEngine::start(test_config(), memory_db().await, FakeServer::new())
            .await
            .unwrap();

        let mut payload = sample_payload();
        payload.device_id = String::new();
        let id = engine.enqueue_sale(payload).await.unwrap();

        let queued = engine.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(queued.payload.device_id, "till-1");

        let mut foreign = sample_payload();
        foreign.device_id = "till-9".to_string();
        let err = engine.enqueue_sale(foreign).await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceMismatch { ref found, .. } if found == "till-9"));
        assert_eq!(engine.state().pending_count, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let engine = SyncEngine::start(test_config(), memory_db().await, FakeServer::new())
            .await
            .unwrap();
        engine.shutdown().await;
        engine.shutdown().await;

        let err = engine.enqueue_sale(sample_payload()).await.unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.sync.max_attempts = 0;

        let result = SyncEngine::start(config, memory_db().await, FakeServer::new()).await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
