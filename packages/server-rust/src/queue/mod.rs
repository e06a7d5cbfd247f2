//! Cloud command queue: a durable FIFO of pending batches per site.
//!
//! A [`Command`] is enqueued by a cloud service, fetched by the site's
//! reconciler (ENQD -> WORK), and completed with the serialized reply
//! (WORK -> DONE). Either side may cancel a non-terminal command. Rows
//! are retained after completion as the audit log.
//!
//! Delivery is at-least-once: a command whose lease lapses in WORK goes
//! back to ENQD and will be fetched again, so appliances must apply
//! batches idempotently (guard with `test`/`testeq`). After the retry
//! cap the queue gives up and cancels the command with a TIMEOUT reply.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgplane_core::{ClockSource, ConfigError, ErrorKind, Reply};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::shutdown::RunState;

pub use memory::MemoryCommandStore;

/// Lifecycle state of a command.
///
/// ```text
/// ENQD --fetch--> WORK --complete--> DONE
///   |               |
///   +--cancel--> CNCL <--cancel-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandState {
    #[serde(rename = "ENQD")]
    Enqd,
    #[serde(rename = "WORK")]
    Work,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CNCL")]
    Cncl,
}

impl CommandState {
    /// `true` for states no transition leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cncl)
    }

    /// Stable storage spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqd => "ENQD",
            Self::Work => "WORK",
            Self::Done => "DONE",
            Self::Cncl => "CNCL",
        }
    }
}

/// One queued (or retained) command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Dense per-site id, assigned at enqueue.
    pub id: i64,
    pub site: Uuid,
    /// Serialized wire batch.
    pub batch: Vec<u8>,
    pub state: CommandState,
    pub enqueued_ms: i64,
    /// Set when the command was last fetched.
    pub sent_ms: Option<i64>,
    /// Set when the command reached a terminal state.
    pub done_ms: Option<i64>,
    /// Serialized wire reply, present once DONE (or CNCL by timeout).
    pub response: Option<Vec<u8>>,
    /// Lease lapses so far.
    pub retries: u32,
}

/// What a reconciler gets from [`CommandStore::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedCommand {
    pub id: i64,
    pub batch: Vec<u8>,
}

/// The durable queue backend.
///
/// `fetch` and `complete` are each a single storage transaction; partial
/// transitions are never observable.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Enqueues a batch for `site`, returning the new command's id.
    async fn enqueue(&self, site: Uuid, batch: Vec<u8>) -> Result<i64, ConfigError>;

    /// Fetches the oldest ENQD command for `site`, moving it to WORK and
    /// stamping `sent_ms`. `None` when the site's queue is empty.
    async fn fetch(&self, site: Uuid) -> Result<Option<FetchedCommand>, ConfigError>;

    /// Completes a WORK command with its reply.
    ///
    /// Commands are keyed `(site, id)`, so a site can only ever complete
    /// a command it fetched itself; the endpoint derives `site` from the
    /// peer's client certificate. A `complete` for a CNCL command is
    /// discarded silently.
    async fn complete(&self, site: Uuid, id: i64, response: Vec<u8>) -> Result<(), ConfigError>;

    /// Cancels an ENQD or WORK command. Terminal commands are untouched.
    async fn cancel(&self, site: Uuid, id: i64) -> Result<(), ConfigError>;

    /// Audit iteration over the id range, ascending.
    async fn list(&self, site: Uuid, range: Range<i64>) -> Result<Vec<Command>, ConfigError>;

    /// Reverts WORK commands whose lease lapsed before `now_ms` back to
    /// ENQD (bumping `retries`), cancelling those past the retry cap
    /// with a TIMEOUT reply. Returns how many commands changed state.
    async fn expire_leases(&self, now_ms: i64) -> Result<u32, ConfigError>;
}

/// The reply recorded on a command cancelled by lease exhaustion.
#[must_use]
pub fn timeout_response() -> Vec<u8> {
    Reply::fail(ErrorKind::Timeout, None)
        .to_bytes()
        .unwrap_or_default()
}

/// Periodically sweeps lapsed leases until shutdown.
pub async fn run_lease_reaper(
    store: Arc<dyn CommandStore>,
    clock: Arc<dyn ClockSource>,
    interval: Duration,
    mut shutdown: watch::Receiver<RunState>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            result = shutdown.changed() => {
                if result.is_err()
                    || matches!(*shutdown.borrow(), RunState::Draining | RunState::Stopped)
                {
                    tracing::debug!("lease reaper stopping");
                    return;
                }
                continue;
            }
        }

        match store.expire_leases(clock.now_ms()).await {
            Ok(0) => {}
            Ok(reverted) => {
                tracing::info!(reverted, "reverted lapsed command leases");
                metrics::counter!("cfgplane_leases_reverted").increment(u64::from(reverted));
            }
            Err(err) => {
                tracing::error!(error = %err, "lease sweep failed");
            }
        }
    }
}
