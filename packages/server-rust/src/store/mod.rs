//! Durable state: snapshot, write-ahead journal, recovery, compaction.
//!
//! Two files live in the data directory, both owned 0600 by the appliance
//! user: `tree.snap` (the last snapshot) and `tree.jrn` (the append-only
//! journal of change sets committed since). Replaying the journal over
//! the snapshot reconstructs the exact tree state at last commit.

mod compactor;
mod journal;
mod snapshot;

use std::path::Path;

use cfgplane_core::{ConfigError, PropertyTree, TreePath, APVERSION, APVERSION_PATH};

pub use compactor::run_compactor;
pub use journal::{Journal, ReplayOutcome};
pub use snapshot::SnapshotStore;

/// Snapshot file name within the data directory.
pub const SNAPSHOT_FILE: &str = "tree.snap";

/// Journal file name within the data directory.
pub const JOURNAL_FILE: &str = "tree.jrn";

/// What recovery found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `true` when the tree was booted fresh (no snapshot, empty journal).
    pub fresh: bool,
    /// Journal records applied on top of the snapshot.
    pub replayed: usize,
    /// `true` when a corrupt journal tail was dropped. Committed state was
    /// lost up to the damaged record; the daemon continues from the last
    /// good one.
    pub lost_tail: bool,
}

/// Rebuilds the tree from the data directory and returns the open journal
/// positioned for appending.
///
/// A fresh boot materialises `@/apversion` so readers can detect the tree
/// schema version; an existing snapshot is refused if it was written
/// under a different schema version.
///
/// # Errors
///
/// `CORRUPT` when the directory cannot be prepared, the snapshot is
/// damaged, or a replayed record contradicts the tree.
pub fn recover(data_dir: &Path) -> Result<(PropertyTree, Journal, RecoveryReport), ConfigError> {
    std::fs::create_dir_all(data_dir).map_err(|err| ConfigError::Corrupt {
        reason: format!("data dir {}: {err}", data_dir.display()),
    })?;

    let snapshot = SnapshotStore::new(data_dir.join(SNAPSHOT_FILE));
    let loaded = snapshot.load()?;
    let fresh_tree = loaded.is_none();
    let mut tree = match loaded {
        Some(tree) => tree,
        None => {
            let mut tree = PropertyTree::new();
            let apversion = TreePath::parse(APVERSION_PATH)?;
            tree.upsert(&apversion, Some(APVERSION.to_string()), None, 0)?;
            tree
        }
    };

    let journal_path = data_dir.join(JOURNAL_FILE);
    let outcome = Journal::replay(&journal_path)?;
    let mut replayed = 0;
    for set in &outcome.sets {
        if set.version <= tree.version() {
            // Already captured by the snapshot.
            continue;
        }
        tree.apply_changeset(set)?;
        replayed += 1;
    }

    if outcome.truncated {
        tracing::warn!(
            path = %journal_path.display(),
            version = tree.version(),
            "journal tail lost; recovered to last good record"
        );
    }
    tracing::info!(
        version = tree.version(),
        replayed,
        fresh = fresh_tree,
        "tree recovered"
    );

    let journal = Journal::open(&journal_path)?;
    Ok((
        tree,
        journal,
        RecoveryReport {
            fresh: fresh_tree && replayed == 0,
            replayed,
            lost_tail: outcome.truncated,
        },
    ))
}

#[cfg(test)]
mod tests {
    use cfgplane_core::{ChangeEvent, ChangeKind, ChangeSet};
    use tempfile::TempDir;

    use super::*;

    fn update(version: u64, path: &str, value: &str) -> ChangeSet {
        ChangeSet {
            version,
            commit_ms: 0,
            events: vec![ChangeEvent {
                path: path.to_string(),
                kind: ChangeKind::Updated,
                value: Some(value.to_string()),
                expiry_ms: None,
            }],
        }
    }

    #[test]
    fn fresh_boot_materialises_apversion() {
        let dir = TempDir::new().unwrap();
        let (tree, _journal, report) = recover(dir.path()).unwrap();
        assert!(report.fresh);
        assert_eq!(report.replayed, 0);
        let info = tree
            .lookup(&TreePath::parse(APVERSION_PATH).unwrap())
            .unwrap();
        assert_eq!(info.value.as_deref(), Some(APVERSION));
    }

    #[test]
    fn journal_replays_over_snapshot() {
        let dir = TempDir::new().unwrap();

        // Boot once and snapshot version 1.
        let (mut tree, _journal, _) = recover(dir.path()).unwrap();
        tree.apply_changeset(&update(1, "@/rings/guest/vlan", "40"))
            .unwrap();
        SnapshotStore::new(dir.path().join(SNAPSHOT_FILE))
            .write(&tree)
            .unwrap();

        // Journal carries versions 1..=3; only 2 and 3 replay.
        let mut journal = Journal::open(&dir.path().join(JOURNAL_FILE)).unwrap();
        journal.append(&update(1, "@/rings/guest/vlan", "40")).unwrap();
        journal.append(&update(2, "@/rings/guest/vlan", "41")).unwrap();
        journal
            .append(&update(3, "@/clients/aa:bb:cc:dd:ee:ff/ipv4", "10.0.0.5"))
            .unwrap();
        drop(journal);

        let (tree, _journal, report) = recover(dir.path()).unwrap();
        assert!(!report.fresh);
        assert_eq!(report.replayed, 2);
        assert_eq!(tree.version(), 3);
        assert_eq!(
            tree.lookup(&TreePath::parse("@/rings/guest/vlan").unwrap())
                .unwrap()
                .value
                .as_deref(),
            Some("41")
        );
        assert_eq!(
            tree.lookup(&TreePath::parse("@/clients/aa:bb:cc:dd:ee:ff/ipv4").unwrap())
                .unwrap()
                .value
                .as_deref(),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn recovery_survives_corrupt_tail() {
        let dir = TempDir::new().unwrap();
        let journal_path = dir.path().join(JOURNAL_FILE);

        let mut journal = Journal::open(&journal_path).unwrap();
        journal.append(&update(1, "@/rings/guest/vlan", "40")).unwrap();
        journal.append(&update(2, "@/rings/guest/vlan", "41")).unwrap();
        drop(journal);

        // Damage the second record.
        let mut bytes = std::fs::read(&journal_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&journal_path, &bytes).unwrap();

        let (tree, _journal, report) = recover(dir.path()).unwrap();
        assert!(report.lost_tail);
        assert_eq!(report.replayed, 1);
        assert_eq!(tree.version(), 1);
    }
}
