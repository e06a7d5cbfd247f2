//! Graceful shutdown coordination.
//!
//! One [`ShutdownCoordinator`] is shared by every task in the daemon. It
//! broadcasts the run state over a watch channel and tracks in-flight
//! local RPC requests with RAII guards so the drain phase knows when the
//! last request has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Daemon run state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Recovery and wiring in progress; requests are refused.
    Booting,
    /// Fully operational.
    Serving,
    /// Shutdown requested; new requests are refused, in-flight work drains.
    Draining,
    /// Every task has stopped.
    Stopped,
}

/// Coordinates shutdown across the daemon's tasks.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<RunState>,
    in_flight: Arc<AtomicU64>,
}

impl ShutdownCoordinator {
    /// Creates a coordinator in the `Booting` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::Booting);
        Self {
            state,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Marks the daemon ready to serve.
    pub fn set_serving(&self) {
        let _ = self.state.send(RunState::Serving);
    }

    /// Requests shutdown: moves to `Draining` and wakes every watcher.
    pub fn begin_shutdown(&self) {
        let _ = self.state.send(RunState::Draining);
    }

    /// Marks the drain complete.
    pub fn set_stopped(&self) {
        let _ = self.state.send(RunState::Stopped);
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// `true` once shutdown has been requested.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self.state(), RunState::Draining | RunState::Stopped)
    }

    /// A receiver tasks can select on to learn about state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// RAII guard counting one in-flight request. The counter survives
    /// handler panics because `Drop` runs during unwinding.
    #[must_use]
    pub fn request_guard(&self) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until every in-flight request finishes or `timeout` passes.
    /// Returns `true` when the drain completed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard decrementing the in-flight counter on drop.
#[derive(Debug)]
pub struct RequestGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
