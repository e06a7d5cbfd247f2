//! Change-notification bus.
//!
//! Subscribers register a regular expression over paths plus the event
//! kinds they care about, and receive [`Notification`]s over a bounded
//! per-subscription channel. The registry is copy-on-write (`ArcSwap`),
//! so the commit path reads it without taking a lock.
//!
//! Delivery contract: within one subscription, events arrive in strict
//! commit order. A slow subscriber never blocks the transaction engine;
//! once its buffer fills, missed events are coalesced into a single
//! [`Notification::Resync`] naming the deepest common ancestor of the
//! missed paths, and normal delivery resumes from the next event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use cfgplane_core::path::common_ancestor;
use cfgplane_core::{ChangeEvent, ChangeKind, ChangeSet, ConfigError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which event kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFilter {
    pub change: bool,
    pub delete: bool,
    pub expire: bool,
}

impl KindFilter {
    /// Every kind.
    #[must_use]
    pub fn all() -> Self {
        Self {
            change: true,
            delete: true,
            expire: true,
        }
    }

    /// Only TTL expirations.
    #[must_use]
    pub fn expire_only() -> Self {
        Self {
            change: false,
            delete: false,
            expire: true,
        }
    }

    #[must_use]
    pub fn accepts(self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Updated => self.change,
            ChangeKind::Deleted => self.delete,
            ChangeKind::Expired => self.expire,
        }
    }
}

/// One delivery to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    /// A change event from the identified commit.
    Event { version: u64, event: ChangeEvent },
    /// The subscriber lagged; state under `path` must be re-read.
    Resync { path: String },
}

#[derive(Debug)]
struct SubscriptionState {
    pattern: Regex,
    kinds: KindFilter,
    tx: mpsc::Sender<Notification>,
    /// Root of the subtree covering events dropped while the buffer was
    /// full. `Some` marks the subscription as lagging.
    resync_root: parking_lot::Mutex<Option<String>>,
}

#[derive(Debug)]
struct BusInner {
    subs: ArcSwap<HashMap<u64, Arc<SubscriptionState>>>,
    next_id: AtomicU64,
    capacity: usize,
    /// Serialises registry copy-on-write swaps.
    register_lock: parking_lot::Mutex<()>,
}

impl BusInner {
    fn unsubscribe(&self, id: u64) {
        let _guard = self.register_lock.lock();
        let mut map = HashMap::clone(&self.subs.load());
        if map.remove(&id).is_some() {
            self.subs.store(Arc::new(map));
            metrics::gauge!("cfgplane_subscriptions").decrement(1.0);
        }
    }
}

/// The bus. One per daemon; internally reference-counted, so cloning or
/// sharing behind another `Arc` are both fine.
#[derive(Debug)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Creates a bus whose subscriptions buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: ArcSwap::from_pointee(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity,
                register_lock: parking_lot::Mutex::new(()),
            }),
        }
    }

    /// Registers a subscription for paths matching `pattern`.
    ///
    /// The returned handle owns the receiving end; dropping it removes
    /// the registration.
    ///
    /// # Errors
    ///
    /// `VALIDATION` when the pattern is not a valid regular expression.
    pub fn subscribe(
        &self,
        pattern: &str,
        kinds: KindFilter,
    ) -> Result<SubscriptionHandle, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|err| ConfigError::Validation {
            path: String::new(),
            reason: format!("subscription pattern: {err}"),
        })?;
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriptionState {
            pattern,
            kinds,
            tx,
            resync_root: parking_lot::Mutex::new(None),
        });

        {
            let _guard = self.inner.register_lock.lock();
            let mut map = HashMap::clone(&self.inner.subs.load());
            map.insert(id, state);
            self.inner.subs.store(Arc::new(map));
        }
        metrics::gauge!("cfgplane_subscriptions").increment(1.0);

        Ok(SubscriptionHandle {
            id,
            rx,
            bus: Arc::clone(&self.inner),
        })
    }

    /// Removes a subscription. Effective immediately: the commit path
    /// sees the new registry on its next load.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id);
    }

    /// Fans one committed change set out to every matching subscription.
    ///
    /// Called by the transaction engine in commit order, under the tree
    /// lock; every push here is non-blocking.
    pub fn publish(&self, set: &ChangeSet) {
        let subs = self.inner.subs.load();
        for event in &set.events {
            for state in subs.values() {
                if !state.kinds.accepts(event.kind) || !state.pattern.is_match(&event.path) {
                    continue;
                }
                Self::deliver(state, set.version, event);
            }
        }
    }

    fn deliver(state: &SubscriptionState, version: u64, event: &ChangeEvent) {
        let mut resync_root = state.resync_root.lock();

        // A lagging subscription owes its subscriber a resync first.
        if let Some(root) = resync_root.clone() {
            match state.tx.try_send(Notification::Resync { path: root }) {
                Ok(()) => {
                    *resync_root = None;
                    metrics::counter!("cfgplane_resyncs_sent").increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Still clogged; widen the resync to cover this event.
                    let widened = resync_root
                        .as_ref()
                        .map(|root| common_ancestor(root, &event.path));
                    *resync_root = widened;
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        match state.tx.try_send(Notification::Event {
            version,
            event: event.clone(),
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(path = %event.path, "subscriber lagging; coalescing into resync");
                *resync_root = Some(event.path.clone());
                metrics::counter!("cfgplane_events_coalesced").increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Waits up to `timeout` for every subscription buffer to drain, then
    /// drops all registrations (closing the channels).
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let subs = self.inner.subs.load();
            let drained = subs
                .values()
                .all(|state| state.tx.capacity() == state.tx.max_capacity());
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _guard = self.inner.register_lock.lock();
        self.inner.subs.store(Arc::new(HashMap::new()));
    }
}

/// Receiving side of a subscription.
///
/// Dropping the handle unregisters the subscription; the bus holds no
/// strong reference back to the subscriber.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    bus: Arc<BusInner>,
}

impl SubscriptionHandle {
    /// Opaque id of this subscription.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next notification, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Non-blocking receive for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
