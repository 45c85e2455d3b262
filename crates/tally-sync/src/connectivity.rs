//! # Connectivity Monitor
//!
//! Turns raw reachability observations into debounced Online/Offline
//! transitions.
//!
//! ## Debounce
//! ```text
//! raw:     Off ──On──Off──On──────────────────────Off──────────────
//!               │    │    │                        │
//!               │    │    └── window starts        └── window starts
//!               │    └── flap back: cancelled
//!               └── window starts
//!
//! stable:  Offline ──────────────────── Online ─────────────── Offline
//!                            (On held for the whole window)  (same rule)
//! ```
//!
//! A raw observation equal to the stable state cancels any pending
//! transition. Repeating the pending observation does not restart its
//! window. Only stable transitions reach `on_change` handlers and
//! `watch()` receivers, so the orchestrator is triggered once per real
//! reconnect and never by a flap.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::notifier::{Listeners, Subscription};
use tally_core::ConnectionStatus;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Debounce {
    stable: ConnectionStatus,
    pending: Option<ConnectionStatus>,
    /// Bumped on every start or cancel; a timer only commits its own.
    generation: u64,
}

struct MonitorInner {
    window: Duration,
    debounce: Mutex<Debounce>,
    /// Held across commit and publication so receivers see commits in order.
    delivery: Mutex<()>,
    stable_tx: watch::Sender<ConnectionStatus>,
    listeners: Listeners<ConnectionStatus>,
}

/// Debounced connectivity state.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Creates a monitor that starts Offline.
    pub fn new(window: Duration) -> Self {
        Self::with_initial(window, ConnectionStatus::Offline)
    }

    /// Creates a monitor with a known starting state.
    pub fn with_initial(window: Duration, initial: ConnectionStatus) -> Self {
        let (stable_tx, _) = watch::channel(initial);

        ConnectivityMonitor {
            inner: Arc::new(MonitorInner {
                window,
                debounce: Mutex::new(Debounce {
                    stable: initial,
                    pending: None,
                    generation: 0,
                }),
                delivery: Mutex::new(()),
                stable_tx,
                listeners: Listeners::new(),
            }),
        }
    }

    /// Last stable status.
    pub fn current_status(&self) -> ConnectionStatus {
        lock(&self.inner.debounce).stable
    }

    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Registers a handler invoked once per stable transition.
    ///
    /// Handlers run under the delivery lock and must not call `report`.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(handler))
    }

    /// Receiver of stable status for async consumers.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.stable_tx.subscribe()
    }

    /// Feeds one raw observation.
    ///
    /// Must be called from within a Tokio runtime; the debounce timer is a
    /// spawned task. Outside a runtime the transition is applied at once.
    pub fn report(&self, raw: ConnectionStatus) {
        let generation = {
            let mut d = lock(&self.inner.debounce);

            if raw == d.stable {
                if d.pending.take().is_some() {
                    d.generation += 1;
                    debug!(stable = %d.stable, "Connectivity flap cancelled");
                }
                return;
            }

            if d.pending == Some(raw) {
                return;
            }

            d.pending = Some(raw);
            d.generation += 1;
            debug!(raw = %raw, window_ms = self.inner.window.as_millis() as u64, "Connectivity change pending");
            d.generation
        };

        if self.inner.window.is_zero() {
            self.commit(generation);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let monitor = self.clone();
                let window = self.inner.window;
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    monitor.commit(generation);
                });
            }
            Err(_) => {
                warn!("No Tokio runtime for debounce timer; applying transition immediately");
                self.commit(generation);
            }
        }
    }

    /// Promotes the pending observation if it is still the one that
    /// started this window.
    fn commit(&self, generation: u64) {
        let _delivery = lock(&self.inner.delivery);

        let status = {
            let mut d = lock(&self.inner.debounce);
            if d.generation != generation {
                return;
            }
            let Some(status) = d.pending.take() else {
                return;
            };
            d.stable = status;
            status
        };

        info!(status = %status, "Connectivity changed");
        self.inner.stable_tx.send_replace(status);
        self.inner.listeners.emit(&status);
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("window", &self.inner.window)
            .field("state", &*lock(&self.inner.debounce))
            .finish()
    }
}
