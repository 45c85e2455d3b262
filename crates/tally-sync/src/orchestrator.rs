//! # Sync Orchestrator
//!
//! Drains the pending sale queue against the transaction server.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Drain Lifecycle                                │
//! │                                                                         │
//! │   connectivity restored ─┐                                             │
//! │   manual_sync() ─────────┼──► run_drain(trigger)                       │
//! │   periodic tick ─────────┘        │                                     │
//! │                                   ├── already draining → AlreadyRunning│
//! │                                   ├── offline          → Offline       │
//! │                                   ▼                                     │
//! │   ┌──────┐   start    ┌─────────┐  nothing left  ┌─────────┐           │
//! │   │ Idle │──────────►│ Syncing │───────────────►│ Success │──┐        │
//! │   └──────┘            └─────────┘                └─────────┘  │        │
//! │      ▲                     │ items left / storage error       │        │
//! │      │                     ▼                                   │        │
//! │      │                ┌─────────┐                              │        │
//! │      │                │  Error  │──────────────────────────────┤        │
//! │      │                └─────────┘                              │        │
//! │      └──────── after result_display, unless a new drain began ─┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Per Item
//! ```text
//! mark_submitting ──► create_sale(local_id, payload)
//!                        │
//!                        ├── Ok        → mark_confirmed → Confirmed outcome → remove
//!                        ├── Transient → mark_retry → budget left?
//!                        │                              ├── yes: backoff, retry
//!                        │                              └── no:  leave Queued
//!                        └── Permanent → mark_rejected → Rejected outcome
//! ```
//!
//! Items are submitted one at a time in `created_at` order. The same
//! `local_id` is sent on every attempt, so a confirmation lost in transit
//! is deduplicated by the server on the next attempt.
//!
//! Connectivity is checked only when a drain starts. Going offline during
//! a pass does not stop it; the per-item retry budget bounds the time spent
//! on failing submissions.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::CacheRefresher;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::notifier::StateNotifier;
use crate::queue::SaleQueue;
use crate::remote::SaleRemote;
use tally_core::{PendingSale, SaleOutcome, SyncStatus};
use tally_db::{Database, SyncMetaRepository};

/// Capacity of the sale outcome broadcast channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Triggers & Outcomes
// =============================================================================

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Stable Offline → Online transition.
    ConnectivityRestored,
    /// Operator pressed "sync now".
    Manual,
    /// Periodic timer.
    Timer,
    /// Sale enqueued while online.
    Enqueued,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTrigger::ConnectivityRestored => write!(f, "connectivity_restored"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Timer => write!(f, "timer"),
            SyncTrigger::Enqueued => write!(f, "enqueued"),
        }
    }
}

/// Summary of one finished drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub trigger: SyncTrigger,
    /// Success or Error.
    pub status: SyncStatus,
    pub confirmed: usize,
    pub rejected: usize,
    /// Items still Queued when the drain ended.
    pub remaining: usize,
    pub error: Option<String>,
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the lock; nothing was done.
    AlreadyRunning,
    /// Monitor reports Offline; nothing was done.
    Offline,
    Finished(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Finished(report) => Some(report),
            _ => None,
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Per-item retry budget within one drain.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        RetryPolicy {
            max_attempts: config.sync.max_attempts,
            initial_backoff: config.initial_backoff(),
            multiplier: config.sync.backoff_multiplier,
            max_backoff: config.max_backoff(),
        }
    }

    /// Fresh backoff schedule for one item: base, base×m, base×m², ... capped.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_backoff,
            // The attempt budget bounds retries, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Drain Guard
// =============================================================================

/// Holds the drain flag; clears it on drop, including on panic or early
/// return.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

enum ItemResult {
    Confirmed,
    Rejected,
    /// Left Queued with this error.
    Deferred(String),
}

#[derive(Debug, Default)]
struct DrainProgress {
    confirmed: usize,
    rejected: usize,
    remaining: usize,
    last_error: Option<String>,
}

/// The sale sync state machine.
pub struct SyncOrchestrator {
    queue: SaleQueue,
    meta: SyncMetaRepository,
    remote: Arc<dyn SaleRemote>,
    cache: Option<CacheRefresher>,
    connectivity: ConnectivityMonitor,
    notifier: StateNotifier,
    outcomes: broadcast::Sender<SaleOutcome>,
    policy: RetryPolicy,
    result_display: Duration,
    running: AtomicBool,
    /// Set by an `Enqueued` trigger that lost the race for `running`.
    rerun_requested: AtomicBool,
    /// Bumped at every drain start; a pending Idle reset only applies to
    /// the drain that scheduled it.
    display_generation: Arc<AtomicU64>,
    /// Serializes count reads with their publication.
    counts_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        config: &SyncConfig,
        db: &Database,
        remote: Arc<dyn SaleRemote>,
        connectivity: ConnectivityMonitor,
        notifier: StateNotifier,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        SyncOrchestrator {
            queue: SaleQueue::new(db),
            meta: db.sync_meta(),
            remote,
            cache: None,
            connectivity,
            notifier,
            outcomes,
            policy: RetryPolicy::from_config(config),
            result_display: config.result_display(),
            running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            display_generation: Arc::new(AtomicU64::new(0)),
            counts_lock: Mutex::new(()),
        }
    }

    /// Refreshes this cache after every drain that leaves nothing queued.
    pub fn with_cache_refresh(mut self, cache: CacheRefresher) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Receiver of per-sale Confirmed/Rejected outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<SaleOutcome> {
        self.outcomes.subscribe()
    }

    pub fn queue(&self) -> &SaleQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    pub async fn on_connectivity_restored(&self) -> DrainOutcome {
        self.run_drain(SyncTrigger::ConnectivityRestored).await
    }

    pub async fn manual_sync(&self) -> DrainOutcome {
        self.run_drain(SyncTrigger::Manual).await
    }

    pub async fn tick(&self) -> DrainOutcome {
        self.run_drain(SyncTrigger::Timer).await
    }

    /// Runs a drain unless one is already running or the terminal is
    /// offline.
    ///
    /// An `Enqueued` trigger that finds a drain running asks it for one
    /// more pass, so a sale recorded just as a drain ends is not left
    /// waiting for the next timer tick.
    pub async fn run_drain(&self, trigger: SyncTrigger) -> DrainOutcome {
        let mut outcome = self.drain_once(trigger).await;

        while matches!(outcome, DrainOutcome::Finished(_))
            && self.rerun_requested.swap(false, Ordering::AcqRel)
        {
            debug!("Sales enqueued during drain, draining again");
            match self.drain_once(SyncTrigger::Enqueued).await {
                next @ DrainOutcome::Finished(_) => outcome = next,
                _ => break,
            }
        }

        outcome
    }

    async fn drain_once(&self, trigger: SyncTrigger) -> DrainOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.running) else {
            if trigger == SyncTrigger::Enqueued {
                self.rerun_requested.store(true, Ordering::Release);
            }
            debug!(trigger = %trigger, "Drain already running");
            return DrainOutcome::AlreadyRunning;
        };

        if !self.connectivity.is_online() {
            debug!(trigger = %trigger, "Offline, drain skipped");
            return DrainOutcome::Offline;
        }

        let generation = self.display_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.notifier.update(|s| s.status = SyncStatus::Syncing);
        info!(trigger = %trigger, "Drain started");

        let report = match self.drain_items().await {
            Ok(progress) => self.finish(trigger, progress).await,
            Err(e) => self.fail(trigger, e).await,
        };

        self.schedule_idle_reset(generation);
        DrainOutcome::Finished(report)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    async fn drain_items(&self) -> SyncResult<DrainProgress> {
        // Safe while we hold the drain flag: no other pass is submitting.
        self.queue.recover_interrupted().await?;

        let mut progress = DrainProgress::default();
        let mut attempted: HashSet<String> = HashSet::new();

        // Re-read after each batch so sales enqueued mid-drain go out in
        // this pass. Items deferred in this pass are not retried again.
        loop {
            let batch: Vec<PendingSale> = self
                .queue
                .peek_ordered()
                .await?
                .into_iter()
                .filter(|sale| !attempted.contains(&sale.local_id))
                .collect();

            if batch.is_empty() {
                break;
            }

            for sale in &batch {
                attempted.insert(sale.local_id.clone());
                match self.submit_with_retry(sale).await? {
                    ItemResult::Confirmed => progress.confirmed += 1,
                    ItemResult::Rejected => progress.rejected += 1,
                    ItemResult::Deferred(error) => {
                        progress.remaining += 1;
                        progress.last_error = Some(error);
                    }
                }

                self.publish_counts().await?;
            }
        }

        self.publish_counts().await?;
        Ok(progress)
    }

    async fn submit_with_retry(&self, sale: &PendingSale) -> SyncResult<ItemResult> {
        let local_id = sale.local_id.as_str();
        let mut backoff = self.policy.backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.queue.mark_submitting(local_id).await?;

            match self.remote.create_sale(local_id, &sale.payload).await {
                Ok(accepted) => {
                    let confirmed = self
                        .queue
                        .mark_confirmed(local_id, &accepted.server_id)
                        .await?;
                    info!(
                        local_id = %local_id,
                        server_id = %accepted.server_id,
                        attempts = confirmed.attempts,
                        "Sale confirmed"
                    );
                    // No receivers is fine
                    let _ = self.outcomes.send(SaleOutcome::Confirmed(confirmed));
                    self.queue.remove(local_id).await?;
                    return Ok(ItemResult::Confirmed);
                }
                Err(e) if e.is_retryable() => {
                    let queued = self.queue.mark_retry(local_id, &e.message).await?;
                    warn!(
                        local_id = %local_id,
                        attempts = queued.attempts,
                        error = %e,
                        "Transient submission failure"
                    );

                    if attempt >= self.policy.max_attempts {
                        debug!(local_id = %local_id, "Retry budget exhausted for this drain");
                        return Ok(ItemResult::Deferred(e.message));
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            debug!(local_id = %local_id, ?delay, "Backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Ok(ItemResult::Deferred(e.message)),
                    }
                }
                Err(e) => {
                    let rejected = self.queue.mark_rejected(local_id, &e.message).await?;
                    warn!(
                        local_id = %local_id,
                        reason = %e,
                        "Sale rejected by server"
                    );
                    let _ = self.outcomes.send(SaleOutcome::Rejected(rejected));
                    return Ok(ItemResult::Rejected);
                }
            }
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    async fn finish(&self, trigger: SyncTrigger, progress: DrainProgress) -> DrainReport {
        if progress.remaining == 0 {
            let now = Utc::now();
            if let Err(e) = self.meta.set_last_sync_time(now).await {
                warn!(?e, "Failed to persist last sync time");
            }
            if let Err(e) = self.meta.set_last_error(None).await {
                warn!(?e, "Failed to clear last error");
            }

            self.notifier.update(|s| {
                s.status = SyncStatus::Success;
                s.last_sync_time = Some(now);
                s.last_error = None;
            });
            info!(
                trigger = %trigger,
                confirmed = progress.confirmed,
                rejected = progress.rejected,
                "Drain succeeded"
            );

            if let Some(cache) = &self.cache {
                if let Err(e) = cache.refresh_all().await {
                    warn!(?e, "Catalog refresh after sync failed");
                }
            }

            return DrainReport {
                trigger,
                status: SyncStatus::Success,
                confirmed: progress.confirmed,
                rejected: progress.rejected,
                remaining: 0,
                error: None,
            };
        }

        let message = progress
            .last_error
            .unwrap_or_else(|| "Sales remain queued".to_string());
        self.record_error(&message).await;
        warn!(
            trigger = %trigger,
            remaining = progress.remaining,
            error = %message,
            "Drain finished with sales still queued"
        );

        DrainReport {
            trigger,
            status: SyncStatus::Error,
            confirmed: progress.confirmed,
            rejected: progress.rejected,
            remaining: progress.remaining,
            error: Some(message),
        }
    }

    /// Local storage failure: the pass is abandoned. Items stay in the
    /// store and the next drain picks them up.
    async fn fail(&self, trigger: SyncTrigger, err: SyncError) -> DrainReport {
        error!(trigger = %trigger, error = %err, "Drain aborted");
        let message = err.to_string();
        self.record_error(&message).await;

        if let Err(e) = self.publish_counts().await {
            debug!(?e, "Counts unavailable after failed drain");
        }

        DrainReport {
            trigger,
            status: SyncStatus::Error,
            confirmed: 0,
            rejected: 0,
            remaining: self.notifier.current().pending_count.max(0) as usize,
            error: Some(message),
        }
    }

    async fn record_error(&self, message: &str) {
        if let Err(e) = self.meta.set_last_error(Some(message)).await {
            warn!(?e, "Failed to persist last error");
        }
        self.notifier.update(|s| {
            s.status = SyncStatus::Error;
            s.last_error = Some(message.to_string());
        });
    }

    fn schedule_idle_reset(&self, generation: u64) {
        let notifier = self.notifier.clone();
        let current = Arc::clone(&self.display_generation);
        let delay = self.result_display;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            notifier.update(|s| {
                if matches!(s.status, SyncStatus::Success | SyncStatus::Error) {
                    s.status = SyncStatus::Idle;
                }
            });
        });
    }

    /// Re-reads queue counts and publishes them.
    pub async fn publish_counts(&self) -> SyncResult<()> {
        let _counts = self.counts_lock.lock().await;
        let pending = self.queue.count_pending().await?;
        let rejected = self.queue.count_rejected().await?;

        self.notifier.update(|s| {
            s.pending_count = pending;
            s.rejected_count = rejected;
        });
        Ok(())
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::testing::{sample_payload, FakeServer};
    use std::sync::Mutex as StdMutex;
    use tally_core::{ConnectionStatus, PendingSaleStatus, SyncState};
    use tally_db::DbConfig;

    struct Harness {
        db: Database,
        server: Arc<FakeServer>,
        monitor: ConnectivityMonitor,
        notifier: StateNotifier,
        orchestrator: Arc<SyncOrchestrator>,
    }

    fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_secs = 1;
        config.sync.result_display_ms = 50;
        config
    }

    async fn harness_with(config: SyncConfig) -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let server = FakeServer::new();
        let monitor = ConnectivityMonitor::with_initial(Duration::ZERO, ConnectionStatus::Online);
        let notifier = StateNotifier::new(SyncState {
            connection_status: ConnectionStatus::Online,
            ..Default::default()
        });
        let orchestrator = Arc::new(SyncOrchestrator::new(
            &config,
            &db,
            server.clone(),
            monitor.clone(),
            notifier.clone(),
        ));

        Harness {
            db,
            server,
            monitor,
            notifier,
            orchestrator,
        }
    }

    async fn harness() -> Harness {
        harness_with(fast_config()).await
    }

    impl Harness {
        async fn enqueue(&self) -> String {
            let id = self
                .orchestrator
                .queue()
                .enqueue(sample_payload())
                .await
                .unwrap();
            self.orchestrator.publish_counts().await.unwrap();
            id
        }

        fn record(&self) -> (Arc<StdMutex<Vec<SyncState>>>, crate::notifier::Subscription) {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let sub = self
                .notifier
                .subscribe(move |s| sink.lock().unwrap().push(s.clone()));
            (seen, sub)
        }
    }

    #[tokio::test]
    async fn test_happy_path_publishes_counts_down_to_zero() {
        let h = harness().await;
        h.enqueue().await;
        h.enqueue().await;
        let (seen, _sub) = h.record();

        let outcome = h.orchestrator.manual_sync().await;

        let report = outcome.report().unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.confirmed, 2);

        let seen = seen.lock().unwrap();
        let statuses: Vec<SyncStatus> = seen.iter().map(|s| s.status).collect();
        assert_eq!(statuses.first(), Some(&SyncStatus::Idle));
        assert!(statuses.contains(&SyncStatus::Syncing));
        assert_eq!(statuses.last(), Some(&SyncStatus::Success));

        let counts: Vec<i64> = seen
            .iter()
            .filter(|s| s.status == SyncStatus::Syncing)
            .map(|s| s.pending_count)
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);

        let last = seen.last().unwrap();
        assert!(last.last_sync_time.is_some());
        assert_eq!(h.server.created(), 2);
        assert!(h.db.sync_meta().last_sync_time().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let h = harness().await;
        let id = h.enqueue().await;
        let mut outcomes = h.orchestrator.subscribe_outcomes();
        h.server.fail_next((0..3).map(|_| RemoteError::from_status(500, "")));

        let outcome = h.orchestrator.manual_sync().await;

        assert_eq!(outcome.report().unwrap().status, SyncStatus::Success);
        match outcomes.recv().await.unwrap() {
            SaleOutcome::Confirmed(sale) => {
                assert_eq!(sale.local_id, id);
                assert_eq!(sale.attempts, 4);
                assert_eq!(sale.status, PendingSaleStatus::Confirmed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.server.calls(), vec![id.clone(); 4]);
        assert!(h.orchestrator.queue().get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_rejected_and_kept() {
        let h = harness().await;
        let id = h.enqueue().await;
        h.server.reject(&id, "unknown sku");
        let mut outcomes = h.orchestrator.subscribe_outcomes();

        let outcome = h.orchestrator.manual_sync().await;

        let report = outcome.report().unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.rejected, 1);
        assert!(matches!(outcomes.recv().await.unwrap(), SaleOutcome::Rejected(_)));

        let state = h.notifier.current();
        assert_eq!(state.pending_count, 0);
        assert_eq!(state.rejected_count, 1);

        let sale = h.orchestrator.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(sale.status, PendingSaleStatus::Rejected);
        assert_eq!(sale.attempts, 1);
        assert!(sale.last_error.unwrap().contains("unknown sku"));
        // Never retried
        assert_eq!(h.server.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_does_not_block_later_items() {
        let h = harness().await;
        let first = h.enqueue().await;
        let second = h.enqueue().await;
        let third = h.enqueue().await;
        h.server.reject(&second, "bad payment");

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(report.confirmed, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(h.server.calls(), vec![first.clone(), second.clone(), third.clone()]);
        assert!(h.orchestrator.queue().get(&first).await.unwrap().is_none());
        assert!(h.orchestrator.queue().get(&third).await.unwrap().is_none());
        assert_eq!(
            h.orchestrator.queue().get(&second).await.unwrap().unwrap().status,
            PendingSaleStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_exhausted_budget_leaves_item_queued() {
        let mut config = fast_config();
        config.sync.max_attempts = 3;
        let h = harness_with(config).await;
        let stuck = h.enqueue().await;
        let next = h.enqueue().await;
        h.server
            .fail_next((0..3).map(|_| RemoteError::from_status(503, "maintenance")));

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.error.as_deref(), Some("HTTP 503: maintenance"));

        let sale = h.orchestrator.queue().get(&stuck).await.unwrap().unwrap();
        assert_eq!(sale.status, PendingSaleStatus::Queued);
        assert_eq!(sale.attempts, 3);
        assert!(h.orchestrator.queue().get(&next).await.unwrap().is_none());

        let state = h.notifier.current();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.pending_count, 1);
        assert_eq!(
            h.db.sync_meta().last_error().await.unwrap().as_deref(),
            Some("HTTP 503: maintenance")
        );

        // The next drain picks it up again with the same key
        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(h.server.calls().last(), Some(&stuck));
        assert_eq!(h.db.sync_meta().last_error().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lost_confirmation_is_not_duplicated() {
        let h = harness().await;
        let id = h.enqueue().await;
        h.server.lose_next_confirmation();

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(h.server.calls(), vec![id.clone(), id]);
        assert_eq!(h.server.created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_drain() {
        let h = harness().await;
        let id = h.enqueue().await;
        h.server.set_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(h.orchestrator.manual_sync(), h.orchestrator.manual_sync());

        let finished = [&a, &b]
            .iter()
            .filter(|o| matches!(o, DrainOutcome::Finished(_)))
            .count();
        assert_eq!(finished, 1);
        assert!(a == DrainOutcome::AlreadyRunning || b == DrainOutcome::AlreadyRunning);
        assert_eq!(h.server.calls(), vec![id]);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_offline_trigger_does_nothing() {
        let h = harness().await;
        h.enqueue().await;
        h.monitor.report(ConnectionStatus::Offline);

        assert_eq!(h.orchestrator.tick().await, DrainOutcome::Offline);
        assert!(h.server.calls().is_empty());
        assert_eq!(h.notifier.current().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_going_offline_does_not_cut_pass_short() {
        let h = harness().await;
        let ids = vec![h.enqueue().await, h.enqueue().await, h.enqueue().await];
        let monitor = h.monitor.clone();
        h.server
            .after_call(move |_| monitor.report(ConnectionStatus::Offline));

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        // Every queued item is still attempted in the running pass
        assert_eq!(h.server.calls(), ids);
        assert_eq!(report.confirmed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(h.notifier.current().pending_count, 0);

        // Only new drains are held back
        h.enqueue().await;
        assert_eq!(h.orchestrator.tick().await, DrainOutcome::Offline);
        assert_eq!(h.server.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_going_offline_keeps_retrying_within_budget() {
        let mut config = fast_config();
        config.sync.max_attempts = 3;
        let h = harness_with(config).await;
        let id = h.enqueue().await;
        let monitor = h.monitor.clone();
        h.server
            .after_call(move |_| monitor.report(ConnectionStatus::Offline));
        h.server.fail_next((0..2).map(|_| RemoteError::transient("connection reset")));

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(h.server.calls(), vec![id.clone(); 3]);
        assert_eq!(report.status, SyncStatus::Success);
        assert!(h.orchestrator.queue().get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_submission_is_resubmitted() {
        let h = harness().await;
        let id = h.enqueue().await;
        // Simulate a crash mid-submission
        h.orchestrator.queue().mark_submitting(&id).await.unwrap();

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(report.confirmed, 1);
        assert_eq!(h.server.calls(), vec![id]);
    }

    #[tokio::test]
    async fn test_result_returns_to_idle_after_display_window() {
        let h = harness().await;
        h.enqueue().await;

        h.orchestrator.manual_sync().await;
        assert_eq!(h.notifier.current().status, SyncStatus::Success);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.notifier.current().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_new_drain_cancels_pending_idle_reset() {
        let mut config = fast_config();
        config.sync.result_display_ms = 150;
        let h = harness_with(config).await;

        h.orchestrator.manual_sync().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orchestrator.manual_sync().await;

        // The first reset would have fired here
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.notifier.current().status, SyncStatus::Success);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.notifier.current().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_success_refreshes_catalog() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let server = FakeServer::new();
        let monitor = ConnectivityMonitor::with_initial(Duration::ZERO, ConnectionStatus::Online);
        let cache = CacheRefresher::new(&db, server.clone(), 50);
        let orchestrator = SyncOrchestrator::new(
            &fast_config(),
            &db,
            server.clone(),
            monitor,
            StateNotifier::new(SyncState::default()),
        )
        .with_cache_refresh(cache.clone());

        orchestrator.manual_sync().await;

        assert_eq!(server.catalog_fetches(), 1);
        assert_eq!(cache.snapshot_info().await.unwrap().products, 2);
    }

    #[tokio::test]
    async fn test_storage_failure_ends_in_error() {
        let h = harness().await;
        h.enqueue().await;
        h.db.close().await;

        let report = h.orchestrator.manual_sync().await.report().cloned().unwrap();

        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.error.unwrap().starts_with("Storage error"));
        assert_eq!(h.notifier.current().status, SyncStatus::Error);
        assert!(h.server.calls().is_empty());
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::from_config(&SyncConfig::default());
        let mut backoff = policy.backoff();

        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_backoff().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]
        );
    }
}
