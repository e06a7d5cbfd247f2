//! Cloud <-> appliance reconciler.
//!
//! The appliance-side loop: fetch the next queued command for this site,
//! run its batch through the transaction engine, and complete the
//! command with the serialized reply. Execution failures travel back in
//! the reply -- the command is DONE either way, and the queue position
//! never rolls back. Transport failures retry with bounded, jittered
//! exponential backoff (1 s initial, 60 s cap, reset on any success).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgplane_core::{Batch, ConfigError, ErrorKind, Reply};
use rand::Rng;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::engine::ConfigEngine;
use crate::queue::{CommandStore, FetchedCommand};
use crate::shutdown::RunState;

/// Transport to the cloud command queue, as seen from one site.
///
/// The production link is an mTLS stream to the cloud endpoint; the
/// in-process [`StoreChannel`] serves single-box deployments and tests.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Next pending command for this site, if any.
    async fn fetch(&self) -> Result<Option<FetchedCommand>, ConfigError>;

    /// Reports the outcome of a fetched command.
    async fn complete(&self, id: i64, reply: Vec<u8>) -> Result<(), ConfigError>;
}

/// [`CommandChannel`] over a directly reachable [`CommandStore`].
pub struct StoreChannel {
    store: Arc<dyn CommandStore>,
    site: Uuid,
}

impl StoreChannel {
    #[must_use]
    pub fn new(store: Arc<dyn CommandStore>, site: Uuid) -> Self {
        Self { store, site }
    }
}

#[async_trait]
impl CommandChannel for StoreChannel {
    async fn fetch(&self) -> Result<Option<FetchedCommand>, ConfigError> {
        self.store.fetch(self.site).await
    }

    async fn complete(&self, id: i64, reply: Vec<u8>) -> Result<(), ConfigError> {
        self.store.complete(self.site, id, reply).await
    }
}

/// Bounded exponential backoff with jitter.
struct Backoff {
    next: Duration,
    initial: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            next: initial,
            initial,
            cap,
        }
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }

    /// The delay to sleep now; doubles the stored delay up to the cap.
    fn advance(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.cap);
        // +-25% jitter keeps a fleet of appliances from reconnecting in
        // lockstep after a cloud outage.
        let jitter = rand::rng().random_range(0.75..1.25);
        base.mul_f64(jitter)
    }
}

/// The appliance-side reconciler task.
pub struct Reconciler {
    channel: Arc<dyn CommandChannel>,
    engine: Arc<ConfigEngine>,
    config: QueueConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        engine: Arc<ConfigEngine>,
        config: QueueConfig,
    ) -> Self {
        Self {
            channel,
            engine,
            config,
        }
    }

    /// Runs until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<RunState>) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_cap);
        tracing::info!("reconciler starting");

        loop {
            if matches!(*shutdown.borrow(), RunState::Draining | RunState::Stopped) {
                tracing::info!("reconciler stopping");
                return;
            }

            let idle_for = match self.channel.fetch().await {
                Ok(Some(command)) => {
                    backoff.reset();
                    self.apply(command).await;
                    // Drain the queue without sleeping between commands.
                    continue;
                }
                Ok(None) => {
                    backoff.reset();
                    self.config.poll_interval
                }
                Err(err) => {
                    let delay = backoff.advance();
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "queue unreachable; backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                () = tokio::time::sleep(idle_for) => {}
                result = shutdown.changed() => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn apply(&self, command: FetchedCommand) {
        let reply = match Batch::from_bytes(&command.batch) {
            Ok(batch) => {
                let engine = Arc::clone(&self.engine);
                match tokio::task::spawn_blocking(move || engine.execute_to_reply(&batch)).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        tracing::error!(id = command.id, error = %err, "batch task panicked");
                        Reply::fail(ErrorKind::Corrupt, None)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(id = command.id, error = %err, "undecodable command batch");
                Reply::fail(ErrorKind::Transport, None)
            }
        };
        tracing::debug!(id = command.id, outcome = %reply.err, "command applied");
        metrics::counter!("cfgplane_commands_applied").increment(1);

        let bytes = reply.to_bytes().unwrap_or_default();
        // A lost complete leaves the command in WORK; the cloud's lease
        // timer will hand it out again and the batch must be idempotent.
        if let Err(err) = self.channel.complete(command.id, bytes).await {
            tracing::warn!(id = command.id, error = %err, "complete failed; command stays leased");
        }
    }
}
