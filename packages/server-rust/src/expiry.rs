//! TTL expiry scheduling.
//!
//! Commits that set an expiry arm an [`ExpiryEntry`] in a shared min-heap.
//! A single task sleeps until the earliest entry fires (1 s resolution,
//! monotonic sleeps against absolute wall-clock fire instants), then asks
//! the engine to remove the node. Entries are never cancelled eagerly:
//! the engine re-checks the node's version at fire time, so an entry made
//! stale by a later set or delete is discarded silently.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use cfgplane_core::ClockSource;
use tokio::sync::watch;
use tokio::sync::Notify;

use crate::engine::ConfigEngine;
use crate::shutdown::RunState;

/// Timer resolution: entries fire within this much of their instant.
const RESOLUTION: Duration = Duration::from_secs(1);

/// One armed TTL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryEntry {
    /// Absolute fire instant, wall-clock milliseconds.
    pub fire_ms: i64,
    /// Path of the node to remove.
    pub path: String,
    /// Node version when the entry was armed; a mismatch at fire time
    /// means the entry is stale.
    pub node_version: u64,
}

/// Shared heap of pending expiries.
#[derive(Debug, Default)]
pub struct ExpirySchedule {
    heap: parking_lot::Mutex<BinaryHeap<Reverse<ExpiryEntry>>>,
    wake: Notify,
}

impl ExpirySchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms an entry. Called by the engine under the tree lock; wakes the
    /// scheduler task in case the new entry fires earliest.
    pub fn arm(&self, path: String, fire_ms: i64, node_version: u64) {
        self.heap.lock().push(Reverse(ExpiryEntry {
            fire_ms,
            path,
            node_version,
        }));
        self.wake.notify_one();
    }

    /// Earliest pending fire instant.
    #[must_use]
    pub fn next_fire_ms(&self) -> Option<i64> {
        self.heap.lock().peek().map(|entry| entry.0.fire_ms)
    }

    /// Pops every entry due at or before `now_ms`.
    fn take_due(&self, now_ms: i64) -> Vec<ExpiryEntry> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|entry| entry.0.fire_ms <= now_ms) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// `true` when no entries are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Runs the expiry loop until shutdown.
///
/// Each due entry becomes a synthetic single-op delete through
/// [`ConfigEngine::execute_expiry`]; the resulting change set is tagged
/// `Expired` so the bus routes it to expire-subscribers.
pub async fn run_expiry(
    schedule: Arc<ExpirySchedule>,
    engine: Arc<ConfigEngine>,
    clock: Arc<dyn ClockSource>,
    mut shutdown: watch::Receiver<RunState>,
) {
    loop {
        let now_ms = clock.now_ms();
        let sleep_for = match schedule.next_fire_ms() {
            Some(fire_ms) if fire_ms <= now_ms => Duration::ZERO,
            Some(fire_ms) => {
                let until = u64::try_from(fire_ms - now_ms).unwrap_or(0);
                Duration::from_millis(until).max(RESOLUTION).min(Duration::from_secs(3600))
            }
            // Nothing armed: wait for an arm() or shutdown.
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            () = schedule.wake.notified() => continue,
            result = shutdown.changed() => {
                if result.is_err() || matches!(*shutdown.borrow(), RunState::Draining | RunState::Stopped) {
                    tracing::debug!("expiry scheduler stopping");
                    return;
                }
                continue;
            }
        }

        for entry in schedule.take_due(clock.now_ms()) {
            let engine = Arc::clone(&engine);
            let path = entry.path.clone();
            let fired = tokio::task::spawn_blocking(move || {
                engine.execute_expiry(&entry.path, entry.node_version)
            })
            .await;
            match fired {
                Ok(Ok(Some(version))) => {
                    tracing::debug!(path = %path, version, "ttl fired");
                    metrics::counter!("cfgplane_expiries_fired").increment(1);
                }
                Ok(Ok(None)) => {
                    // Stale entry: node re-set or already gone.
                }
                Ok(Err(err)) => {
                    tracing::error!(path = %path, error = %err, "expiry commit failed");
                }
                Err(join_err) => {
                    tracing::error!(path = %path, error = %join_err, "expiry task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_pop_in_fire_order() {
        let schedule = ExpirySchedule::new();
        schedule.arm("@/b".into(), 2000, 2);
        schedule.arm("@/a".into(), 1000, 1);
        schedule.arm("@/c".into(), 3000, 3);

        assert_eq!(schedule.next_fire_ms(), Some(1000));
        let due = schedule.take_due(2500);
        let paths: Vec<&str> = due.iter().map(|entry| entry.path.as_str()).collect();
        assert_eq!(paths, vec!["@/a", "@/b"]);
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn take_due_leaves_future_entries() {
        let schedule = ExpirySchedule::new();
        schedule.arm("@/later".into(), 10_000, 1);
        assert!(schedule.take_due(5_000).is_empty());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn duplicate_paths_coexist_with_distinct_versions() {
        // A re-set node leaves its old entry in place; the version check
        // at fire time discards the stale one.
        let schedule = ExpirySchedule::new();
        schedule.arm("@/a".into(), 1000, 1);
        schedule.arm("@/a".into(), 5000, 2);
        assert_eq!(schedule.len(), 2);

        let due = schedule.take_due(1000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].node_version, 1);
    }
}
