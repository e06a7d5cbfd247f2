//! Background snapshot/journal compaction.
//!
//! The compactor clones the live tree, writes a fresh snapshot, and
//! drops the journal prefix the snapshot subsumes. It runs on a slow
//! interval, with a faster probe that triggers early when the journal
//! outgrows its high-water mark. Writers are blocked only for the
//! in-memory clone; serialisation and file I/O happen off-lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::CompactionConfig;
use crate::engine::ConfigEngine;
use crate::shutdown::RunState;
use crate::store::SnapshotStore;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// `true` when the journal has outgrown the configured high-water mark.
fn over_high_water(journal_len: u64, config: &CompactionConfig) -> bool {
    journal_len > config.journal_high_water
}

/// Runs compaction until shutdown.
pub async fn run_compactor(
    engine: Arc<ConfigEngine>,
    store: SnapshotStore,
    config: CompactionConfig,
    mut shutdown: watch::Receiver<RunState>,
) {
    let mut tick = tokio::time::interval(config.interval);
    let mut probe = tokio::time::interval(PROBE_INTERVAL.min(config.interval));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of `interval` completes immediately; skip it so a
    // freshly booted daemon does not compact an empty journal.
    tick.tick().await;
    probe.tick().await;

    loop {
        let probe_only = tokio::select! {
            _ = tick.tick() => false,
            _ = probe.tick() => true,
            result = shutdown.changed() => {
                if result.is_err()
                    || matches!(*shutdown.borrow(), RunState::Draining | RunState::Stopped)
                {
                    tracing::debug!("compactor stopping");
                    return;
                }
                continue;
            }
        };

        let journal_len = match engine.journal_len() {
            Ok(len) => len,
            Err(err) => {
                tracing::error!(error = %err, "compactor could not stat journal");
                continue;
            }
        };
        let due = if probe_only {
            over_high_water(journal_len, &config)
        } else {
            journal_len > 0
        };
        if !due {
            continue;
        }

        let engine = Arc::clone(&engine);
        let store = store.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.compact(&store)).await;
        match outcome {
            Ok(Ok(())) => {
                metrics::counter!("cfgplane_compactions").increment(1);
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "compaction failed; will retry next interval");
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "compaction task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_comparison() {
        let config = CompactionConfig {
            interval: Duration::from_secs(300),
            journal_high_water: 1000,
        };
        assert!(!over_high_water(1000, &config));
        assert!(over_high_water(1001, &config));
    }
}
