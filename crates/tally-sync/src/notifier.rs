//! # State Notifier
//!
//! Synchronous publish/subscribe of [`SyncState`].
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ordered Delivery                                 │
//! │                                                                         │
//! │  orchestrator ──update()──┐                                            │
//! │                           ▼                                             │
//! │  connectivity ──update()──► [delivery lock] ──► state changed?         │
//! │                                                    │                    │
//! │                                     no ◄───────────┤                    │
//! │                                     (nothing sent) │ yes                │
//! │                                                    ▼                    │
//! │                             handler 1 → handler 2 → ... (in order)     │
//! │                                                                         │
//! │  subscribe() takes the same lock and delivers the current state first, │
//! │  so a new subscriber never misses or reorders a transition.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers run on the publishing thread and must not call back into the
//! notifier. A panicking handler is logged and skipped.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::error;

use tally_core::SyncState;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the handler. It will not be called again.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

// =============================================================================
// Listener Registry
// =============================================================================

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Ordered list of handlers for values of `T`.
pub(crate) struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Listeners {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, handler: Handler<T>) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, handler));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).handlers.retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.registry).handlers.len()
    }

    /// Calls every handler in registration order.
    ///
    /// The handler list is cloned first so handlers may unsubscribe.
    pub(crate) fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            call_guarded(&handler, value);
        }
    }
}

fn call_guarded<T>(handler: &Handler<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
        error!("Subscriber panicked; notification dropped for this subscriber");
    }
}

// =============================================================================
// State Notifier
// =============================================================================

struct NotifierInner {
    state: Mutex<SyncState>,
    delivery: Mutex<()>,
    listeners: Listeners<SyncState>,
}

/// Holds the current [`SyncState`] and fans out every change.
///
/// Cheap to clone; clones share state and subscribers.
#[derive(Clone)]
pub struct StateNotifier {
    inner: Arc<NotifierInner>,
}

impl StateNotifier {
    pub fn new(initial: SyncState) -> Self {
        StateNotifier {
            inner: Arc::new(NotifierInner {
                state: Mutex::new(initial),
                delivery: Mutex::new(()),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Registers a handler and immediately calls it with the current state.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let handler: Handler<SyncState> = Arc::new(handler);

        let _delivery = lock(&self.inner.delivery);
        let current = self.current();
        call_guarded(&handler, &current);
        self.inner.listeners.add(handler)
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> SyncState {
        lock(&self.inner.state).clone()
    }

    /// Applies a mutation and publishes the result if anything changed.
    ///
    /// Returns the state after the mutation.
    pub fn update<F>(&self, mutate: F) -> SyncState
    where
        F: FnOnce(&mut SyncState),
    {
        let _delivery = lock(&self.inner.delivery);

        let (changed, snapshot) = {
            let mut state = lock(&self.inner.state);
            let before = state.clone();
            mutate(&mut state);
            (*state != before, state.clone())
        };

        if changed {
            self.inner.listeners.emit(&snapshot);
        }

        snapshot
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl fmt::Debug for StateNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNotifier")
            .field("state", &self.current())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::SyncStatus;

    fn recorder() -> (Arc<Mutex<Vec<SyncState>>>, impl Fn(&SyncState) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |s: &SyncState| sink.lock().unwrap().push(s.clone()))
    }

    #[test]
    fn test_subscribe_delivers_current_state_immediately() {
        let notifier = StateNotifier::new(SyncState {
            pending_count: 3,
            ..Default::default()
        });
        let (seen, handler) = recorder();

        let _sub = notifier.subscribe(handler);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].pending_count, 3);
    }

    #[test]
    fn test_unchanged_update_is_not_published() {
        let notifier = StateNotifier::new(SyncState::default());
        let (seen, handler) = recorder();
        let _sub = notifier.subscribe(handler);

        notifier.update(|s| s.pending_count = 0);
        notifier.update(|s| s.status = SyncStatus::Syncing);

        let statuses: Vec<_> = seen.lock().unwrap().iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![SyncStatus::Idle, SyncStatus::Syncing]);
    }

    #[test]
    fn test_drop_and_unsubscribe_remove_handler() {
        let notifier = StateNotifier::new(SyncState::default());
        let (seen_a, a) = recorder();
        let (seen_b, b) = recorder();

        let sub_a = notifier.subscribe(a);
        let sub_b = notifier.subscribe(b);
        assert_eq!(notifier.subscriber_count(), 2);

        sub_a.unsubscribe();
        drop(sub_b);
        assert_eq!(notifier.subscriber_count(), 0);

        notifier.update(|s| s.pending_count = 9);
        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let notifier = StateNotifier::new(SyncState::default());
        let _bad = notifier.subscribe(|s: &SyncState| {
            if s.pending_count > 0 {
                panic!("subscriber bug");
            }
        });
        let (seen, handler) = recorder();
        let _good = notifier.subscribe(handler);

        let after = notifier.update(|s| s.pending_count = 1);

        assert_eq!(after.pending_count, 1);
        assert_eq!(seen.lock().unwrap().last().unwrap().pending_count, 1);
    }

    #[test]
    fn test_concurrent_updates_reach_all_subscribers_in_same_order() {
        let notifier = StateNotifier::new(SyncState::default());
        let (seen_a, a) = recorder();
        let (seen_b, b) = recorder();
        let _sa = notifier.subscribe(a);
        let _sb = notifier.subscribe(b);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let n = notifier.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        n.update(|s| s.pending_count += 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let a: Vec<i64> = seen_a.lock().unwrap().iter().map(|s| s.pending_count).collect();
        let b: Vec<i64> = seen_b.lock().unwrap().iter().map(|s| s.pending_count).collect();
        assert_eq!(a, b);
        assert_eq!(a, (0..=200).collect::<Vec<i64>>());
    }
}
