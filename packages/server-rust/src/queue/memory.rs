//! In-memory [`CommandStore`].
//!
//! The default backend: per-site queues behind one mutex. State
//! transitions are atomic by construction (the mutex spans each call),
//! matching the single-transaction contract of the trait. Durability
//! across restarts is the Postgres backend's job.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgplane_core::{ClockSource, ConfigError};
use uuid::Uuid;

use super::{timeout_response, Command, CommandState, CommandStore, FetchedCommand};

#[derive(Debug, Default)]
struct SiteQueue {
    last_id: i64,
    commands: BTreeMap<i64, Command>,
}

/// Mutex-guarded per-site queues.
pub struct MemoryCommandStore {
    sites: parking_lot::Mutex<HashMap<Uuid, SiteQueue>>,
    clock: Arc<dyn ClockSource>,
    lease_ms: i64,
    max_retries: u32,
}

impl MemoryCommandStore {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, lease_window: Duration, max_retries: u32) -> Self {
        Self {
            sites: parking_lot::Mutex::new(HashMap::new()),
            clock,
            lease_ms: i64::try_from(lease_window.as_millis()).unwrap_or(i64::MAX),
            max_retries,
        }
    }

    /// Point read for tests and diagnostics.
    #[must_use]
    pub fn command(&self, site: Uuid, id: i64) -> Option<Command> {
        self.sites
            .lock()
            .get(&site)
            .and_then(|queue| queue.commands.get(&id))
            .cloned()
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn enqueue(&self, site: Uuid, batch: Vec<u8>) -> Result<i64, ConfigError> {
        let mut sites = self.sites.lock();
        let queue = sites.entry(site).or_default();
        queue.last_id += 1;
        let id = queue.last_id;
        queue.commands.insert(
            id,
            Command {
                id,
                site,
                batch,
                state: CommandState::Enqd,
                enqueued_ms: self.clock.now_ms(),
                sent_ms: None,
                done_ms: None,
                response: None,
                retries: 0,
            },
        );
        metrics::counter!("cfgplane_commands_enqueued").increment(1);
        Ok(id)
    }

    async fn fetch(&self, site: Uuid) -> Result<Option<FetchedCommand>, ConfigError> {
        let mut sites = self.sites.lock();
        let Some(queue) = sites.get_mut(&site) else {
            return Ok(None);
        };
        // BTreeMap iterates in id order: FIFO per site.
        let next = queue
            .commands
            .values_mut()
            .find(|command| command.state == CommandState::Enqd);
        let Some(command) = next else {
            return Ok(None);
        };
        command.state = CommandState::Work;
        command.sent_ms = Some(self.clock.now_ms());
        Ok(Some(FetchedCommand {
            id: command.id,
            batch: command.batch.clone(),
        }))
    }

    async fn complete(&self, site: Uuid, id: i64, response: Vec<u8>) -> Result<(), ConfigError> {
        let mut sites = self.sites.lock();
        let command = sites
            .get_mut(&site)
            .and_then(|queue| queue.commands.get_mut(&id))
            .ok_or(ConfigError::NotFound {
                path: format!("command {id}"),
            })?;
        match command.state {
            CommandState::Work => {
                command.state = CommandState::Done;
                command.done_ms = Some(self.clock.now_ms());
                command.response = Some(response);
                metrics::counter!("cfgplane_commands_completed").increment(1);
                Ok(())
            }
            // A late complete for a cancelled command is discarded.
            CommandState::Cncl => Ok(()),
            CommandState::Enqd | CommandState::Done => Err(ConfigError::Busy),
        }
    }

    async fn cancel(&self, site: Uuid, id: i64) -> Result<(), ConfigError> {
        let mut sites = self.sites.lock();
        let command = sites
            .get_mut(&site)
            .and_then(|queue| queue.commands.get_mut(&id))
            .ok_or(ConfigError::NotFound {
                path: format!("command {id}"),
            })?;
        if !command.state.is_terminal() {
            command.state = CommandState::Cncl;
            command.done_ms = Some(self.clock.now_ms());
            metrics::counter!("cfgplane_commands_cancelled").increment(1);
        }
        Ok(())
    }

    async fn list(&self, site: Uuid, range: Range<i64>) -> Result<Vec<Command>, ConfigError> {
        let sites = self.sites.lock();
        Ok(sites
            .get(&site)
            .map(|queue| queue.commands.range(range).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn expire_leases(&self, now_ms: i64) -> Result<u32, ConfigError> {
        let mut sites = self.sites.lock();
        let mut changed = 0u32;
        for queue in sites.values_mut() {
            for command in queue.commands.values_mut() {
                if command.state != CommandState::Work {
                    continue;
                }
                let lapsed = command
                    .sent_ms
                    .is_some_and(|sent| sent.saturating_add(self.lease_ms) <= now_ms);
                if !lapsed {
                    continue;
                }
                changed += 1;
                if command.retries >= self.max_retries {
                    command.state = CommandState::Cncl;
                    command.done_ms = Some(now_ms);
                    command.response = Some(timeout_response());
                    tracing::warn!(id = command.id, "command exhausted its lease retries");
                } else {
                    command.state = CommandState::Enqd;
                    command.retries += 1;
                    command.sent_ms = None;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use cfgplane_core::{Batch, ErrorKind, Reply, SystemClock};

    use super::*;

    fn store() -> MemoryCommandStore {
        MemoryCommandStore::new(Arc::new(SystemClock), Duration::from_secs(120), 3)
    }

    fn store_with_clock(clock: Arc<dyn ClockSource>) -> MemoryCommandStore {
        MemoryCommandStore::new(clock, Duration::from_secs(120), 1)
    }

    struct FixedClock(i64);
    impl ClockSource for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0
        }
    }

    fn batch_bytes() -> Vec<u8> {
        Batch::new("cloud", 10)
            .create("@/rings/guest/vlan", "40", None)
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn ids_are_dense_per_site() {
        let store = store();
        let site_a = Uuid::new_v4();
        let site_b = Uuid::new_v4();

        assert_eq!(store.enqueue(site_a, batch_bytes()).await.unwrap(), 1);
        assert_eq!(store.enqueue(site_a, batch_bytes()).await.unwrap(), 2);
        assert_eq!(store.enqueue(site_b, batch_bytes()).await.unwrap(), 1);
        assert_eq!(store.enqueue(site_a, batch_bytes()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn fetch_is_fifo_and_moves_to_work() {
        let store = store();
        let site = Uuid::new_v4();
        let first = store.enqueue(site, b"one".to_vec()).await.unwrap();
        let second = store.enqueue(site, b"two".to_vec()).await.unwrap();

        let fetched = store.fetch(site).await.unwrap().unwrap();
        assert_eq!(fetched.id, first);
        assert_eq!(fetched.batch, b"one");

        let command = store.command(site, first).unwrap();
        assert_eq!(command.state, CommandState::Work);
        assert!(command.sent_ms.is_some());

        // WORK does not block later fetches.
        let fetched = store.fetch(site).await.unwrap().unwrap();
        assert_eq!(fetched.id, second);
        assert!(store.fetch(site).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_on_empty_site_is_none() {
        let store = store();
        assert!(store.fetch(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_records_reply_and_timestamps() {
        let store = store();
        let site = Uuid::new_v4();
        let id = store.enqueue(site, batch_bytes()).await.unwrap();
        store.fetch(site).await.unwrap().unwrap();

        let reply = Reply::ok(String::new()).to_bytes().unwrap();
        store.complete(site, id, reply.clone()).await.unwrap();

        let rows = store.list(site, 0..i64::MAX).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, CommandState::Done);
        assert!(rows[0].sent_ms.is_some());
        assert!(rows[0].done_ms.is_some());
        assert_eq!(rows[0].response.as_deref(), Some(reply.as_slice()));
    }

    #[tokio::test]
    async fn complete_before_fetch_is_refused() {
        let store = store();
        let site = Uuid::new_v4();
        let id = store.enqueue(site, batch_bytes()).await.unwrap();
        let err = store.complete(site, id, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Busy));
    }

    #[tokio::test]
    async fn complete_from_wrong_site_is_not_found() {
        let store = store();
        let site = Uuid::new_v4();
        let id = store.enqueue(site, batch_bytes()).await.unwrap();
        store.fetch(site).await.unwrap();

        // Commands are keyed per site; another site cannot even see it.
        let err = store
            .complete(Uuid::new_v4(), id, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_swallows_late_complete() {
        let store = store();
        let site = Uuid::new_v4();
        let id = store.enqueue(site, batch_bytes()).await.unwrap();
        store.fetch(site).await.unwrap();
        store.cancel(site, id).await.unwrap();

        assert_eq!(store.command(site, id).unwrap().state, CommandState::Cncl);

        // The appliance's complete arrives after the cancel: discarded.
        store.complete(site, id, Vec::new()).await.unwrap();
        let command = store.command(site, id).unwrap();
        assert_eq!(command.state, CommandState::Cncl);
        assert!(command.response.is_none());

        // Cancelling a terminal command changes nothing.
        store.cancel(site, id).await.unwrap();
        assert_eq!(store.command(site, id).unwrap().state, CommandState::Cncl);
    }

    #[tokio::test]
    async fn refetch_after_lease_lapse() {
        let clock = Arc::new(FixedClock(1_000_000));
        let store = MemoryCommandStore::new(
            Arc::clone(&clock) as Arc<dyn ClockSource>,
            Duration::from_secs(10),
            1,
        );
        let site = Uuid::new_v4();
        let id = store.enqueue(site, batch_bytes()).await.unwrap();
        store.fetch(site).await.unwrap().unwrap();

        // Lease has not lapsed yet.
        assert_eq!(store.expire_leases(1_005_000).await.unwrap(), 0);
        // Lapsed: back to ENQD with one retry recorded.
        assert_eq!(store.expire_leases(1_010_000).await.unwrap(), 1);
        let command = store.command(site, id).unwrap();
        assert_eq!(command.state, CommandState::Enqd);
        assert_eq!(command.retries, 1);
        assert!(command.sent_ms.is_none());

        // The same command is fetched again: at-least-once delivery.
        let fetched = store.fetch(site).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);

        // A second lapse exceeds max_retries=1: cancelled with TIMEOUT.
        assert_eq!(store.expire_leases(2_000_000).await.unwrap(), 1);
        let command = store.command(site, id).unwrap();
        assert_eq!(command.state, CommandState::Cncl);
        let reply = Reply::from_bytes(command.response.as_deref().unwrap()).unwrap();
        assert_eq!(reply.err, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn list_filters_by_id_range() {
        let store = store();
        let site = Uuid::new_v4();
        for _ in 0..5 {
            store.enqueue(site, batch_bytes()).await.unwrap();
        }
        let rows = store.list(site, 2..4).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn state_sequence_is_a_legal_prefix() {
        // Every command history must be a prefix of ENQD,WORK,DONE or
        // end in CNCL.
        let store = store_with_clock(Arc::new(SystemClock));
        let site = Uuid::new_v4();

        let done = store.enqueue(site, batch_bytes()).await.unwrap();
        store.fetch(site).await.unwrap();
        store.complete(site, done, Vec::new()).await.unwrap();
        assert_eq!(store.command(site, done).unwrap().state, CommandState::Done);

        let cancelled = store.enqueue(site, batch_bytes()).await.unwrap();
        store.cancel(site, cancelled).await.unwrap();
        assert_eq!(
            store.command(site, cancelled).unwrap().state,
            CommandState::Cncl
        );

        // DONE is terminal: cancel leaves it alone.
        store.cancel(site, done).await.unwrap();
        assert_eq!(store.command(site, done).unwrap().state, CommandState::Done);
    }
}
