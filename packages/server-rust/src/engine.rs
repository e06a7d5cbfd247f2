//! The transaction engine.
//!
//! [`ConfigEngine`] is the only writer of the property tree. A batch is
//! applied in order under the tree's writer-exclusive lock; the first
//! failing operation rolls back every effect and reports its kind plus
//! ordinal. A successful batch is assigned the next version, written to
//! the journal (fsynced), committed in memory, and only then handed to
//! the notification bus and the expiry scheduler -- both as non-blocking
//! pushes, so no subscriber callback ever runs under the lock.

use std::sync::Arc;

use cfgplane_core::wire::{LEVEL_INTERNAL, LEVEL_OPERATOR};
use cfgplane_core::{
    Batch, ChangeEvent, ChangeKind, ChangeSet, ClockSource, ConfigError, OpKind, PropertyNode,
    PropertyTree, Reply, TreePath, Validator, WireOp,
};
use parking_lot::{Mutex, RwLock};

use crate::expiry::ExpirySchedule;
use crate::notify::NotificationBus;
use crate::store::Journal;

/// User properties that are write-restricted to internal producers.
const SECRET_PROPS: [&str; 3] = ["userPassword", "userMD4Password", "totp"];

/// A batch failure: exactly one kind plus the ordinal of the failing op.
/// `ordinal` is `None` when the commit itself (journal write) failed
/// rather than an individual operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct BatchError {
    pub error: ConfigError,
    pub ordinal: Option<u32>,
}

impl BatchError {
    fn at(error: ConfigError, ordinal: usize) -> Self {
        Self {
            error,
            ordinal: u32::try_from(ordinal).ok(),
        }
    }

    /// The wire reply for this failure.
    #[must_use]
    pub fn to_reply(&self) -> Reply {
        Reply::fail(self.error.kind(), self.ordinal)
    }
}

/// Result of a committed (or read-only) batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// Concatenated `GET` results in batch order.
    pub reply: String,
    /// Version assigned to the commit; `None` for read-only batches.
    pub version: Option<u64>,
}

impl ExecOutcome {
    /// The wire reply for this outcome.
    #[must_use]
    pub fn to_reply(&self) -> Reply {
        Reply::ok(self.reply.clone())
    }
}

enum Undo {
    /// `insert` created this subtree root (plus everything below it).
    Insert { created_root: TreePath },
    /// `replace` overwrote this prior leaf state.
    Replace {
        path: TreePath,
        value: String,
        expiry_ms: Option<i64>,
        version: u64,
    },
    /// `delete` detached this node.
    Remove { path: TreePath, node: PropertyNode },
}

/// Owner of the tree, the validator, and the journal.
pub struct ConfigEngine {
    tree: RwLock<PropertyTree>,
    journal: Mutex<Journal>,
    validator: Arc<Validator>,
    bus: Arc<NotificationBus>,
    expiry: Arc<ExpirySchedule>,
    clock: Arc<dyn ClockSource>,
}

impl ConfigEngine {
    #[must_use]
    pub fn new(
        tree: PropertyTree,
        journal: Journal,
        validator: Arc<Validator>,
        bus: Arc<NotificationBus>,
        expiry: Arc<ExpirySchedule>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            tree: RwLock::new(tree),
            journal: Mutex::new(journal),
            validator,
            bus,
            expiry,
            clock,
        }
    }

    /// Version of the last committed batch.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tree.read().version()
    }

    /// The shared validator, for runtime setting registration.
    #[must_use]
    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Reads a runtime setting leaf, if present.
    #[must_use]
    pub fn setting(&self, daemon: &str, name: &str) -> Option<String> {
        let path = TreePath::parse(&format!("@/settings/{daemon}/{name}")).ok()?;
        self.tree.read().lookup(&path).ok()?.value
    }

    /// Applies one batch atomically.
    ///
    /// # Errors
    ///
    /// [`BatchError`] naming the kind and ordinal of the first failing
    /// op; the tree is unchanged in that case.
    pub fn execute(&self, batch: &Batch) -> Result<ExecOutcome, BatchError> {
        let mut tree = self.tree.write();
        let tentative = tree.version() + 1;
        let mut undo: Vec<Undo> = Vec::new();
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut reply = String::new();

        for (ordinal, op) in batch.ops.iter().enumerate() {
            if let Err(error) = Self::apply_op(
                &self.validator,
                &mut *tree,
                batch,
                op,
                tentative,
                &mut undo,
                &mut events,
                &mut reply,
            ) {
                Self::rollback(&mut *tree, undo);
                metrics::counter!("cfgplane_batches_failed").increment(1);
                tracing::debug!(
                    sender = %batch.sender,
                    ordinal,
                    error = %error,
                    "batch rolled back"
                );
                return Err(BatchError::at(error, ordinal));
            }
        }

        if events.is_empty() {
            // Read-only batch: nothing to journal or announce.
            return Ok(ExecOutcome {
                reply,
                version: None,
            });
        }

        let set = ChangeSet {
            version: tentative,
            commit_ms: self.clock.now_ms(),
            events,
        };
        if let Err(error) = self.journal.lock().append(&set) {
            Self::rollback(&mut *tree, undo);
            tracing::error!(error = %error, "journal append failed; batch rejected");
            metrics::counter!("cfgplane_commit_failures").increment(1);
            return Err(BatchError {
                error,
                ordinal: None,
            });
        }

        tree.set_version(tentative);
        for event in &set.events {
            if event.kind == ChangeKind::Updated {
                if let Some(fire_ms) = event.expiry_ms {
                    self.expiry.arm(event.path.clone(), fire_ms, tentative);
                }
            }
        }
        // Publishing under the lock keeps bus order equal to commit order;
        // every push is a bounded try_send.
        self.bus.publish(&set);
        drop(tree);

        metrics::counter!("cfgplane_batches_committed").increment(1);
        tracing::debug!(sender = %batch.sender, version = tentative, "batch committed");
        Ok(ExecOutcome {
            reply,
            version: Some(tentative),
        })
    }

    /// Executes a batch and folds the outcome into a wire [`Reply`].
    #[must_use]
    pub fn execute_to_reply(&self, batch: &Batch) -> Reply {
        match self.execute(batch) {
            Ok(outcome) => outcome.to_reply(),
            Err(err) => err.to_reply(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_op(
        validator: &Validator,
        tree: &mut PropertyTree,
        batch: &Batch,
        op: &WireOp,
        version: u64,
        undo: &mut Vec<Undo>,
        events: &mut Vec<ChangeEvent>,
        reply: &mut String,
    ) -> Result<(), ConfigError> {
        if op.op == OpKind::Ping {
            return Ok(());
        }
        let path = TreePath::parse(&op.path)?;

        if op.op.mutates() {
            Self::check_access(batch.access_level, &path)?;
        }

        match op.op {
            OpKind::Ping => {}
            OpKind::Get => {
                let subtree = tree.export(&path)?;
                let json =
                    serde_json::to_string(&subtree).map_err(|err| ConfigError::Corrupt {
                        reason: format!("subtree encode: {err}"),
                    })?;
                reply.push_str(&json);
            }
            OpKind::Test => {
                tree.lookup(&path)?;
            }
            OpKind::TestEq => {
                let expected = op.value.as_deref().ok_or_else(|| ConfigError::Validation {
                    path: op.path.clone(),
                    reason: "testeq requires a value".to_string(),
                })?;
                let info = tree.lookup(&path)?;
                if info.value.as_deref() != Some(expected) {
                    return Err(ConfigError::Mismatch {
                        path: op.path.clone(),
                    });
                }
            }
            OpKind::Set => {
                let value = Self::required_value(op)?;
                validator.validate(&path, value)?;
                let old = tree.replace(&path, value.to_string(), op.expires, version)?;
                undo.push(Undo::Replace {
                    path: path.clone(),
                    value: old.value,
                    expiry_ms: old.expiry_ms,
                    version: old.version,
                });
                events.push(ChangeEvent {
                    path: op.path.clone(),
                    kind: ChangeKind::Updated,
                    value: Some(value.to_string()),
                    expiry_ms: op.expires,
                });
            }
            OpKind::Create => {
                let value = Self::required_value(op)?;
                validator.validate(&path, value)?;
                let inserted = tree.insert(&path, value.to_string(), op.expires, version)?;
                undo.push(Undo::Insert {
                    created_root: inserted.created_root,
                });
                events.push(ChangeEvent {
                    path: op.path.clone(),
                    kind: ChangeKind::Updated,
                    value: Some(value.to_string()),
                    expiry_ms: op.expires,
                });
            }
            OpKind::Delete => {
                let node = tree.remove(&path)?;
                undo.push(Undo::Remove {
                    path: path.clone(),
                    node,
                });
                events.push(ChangeEvent {
                    path: op.path.clone(),
                    kind: ChangeKind::Deleted,
                    value: None,
                    expiry_ms: None,
                });
            }
        }
        Ok(())
    }

    fn required_value(op: &WireOp) -> Result<&str, ConfigError> {
        op.value.as_deref().ok_or_else(|| ConfigError::Validation {
            path: op.path.clone(),
            reason: format!("{:?} requires a value", op.op),
        })
    }

    fn check_access(access_level: i32, path: &TreePath) -> Result<(), ConfigError> {
        if access_level < LEVEL_OPERATOR {
            return Err(ConfigError::Unauthorized);
        }
        let labels = path.labels();
        let is_secret = labels.len() == 4
            && labels[1] == "users"
            && SECRET_PROPS.contains(&labels[3].as_str());
        if is_secret && access_level < LEVEL_INTERNAL {
            return Err(ConfigError::Unauthorized);
        }
        Ok(())
    }

    fn rollback(tree: &mut PropertyTree, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            let restored = match entry {
                Undo::Insert { created_root } => tree.remove(&created_root).map(|_| ()),
                Undo::Replace {
                    path,
                    value,
                    expiry_ms,
                    version,
                } => tree.replace(&path, value, expiry_ms, version).map(|_| ()),
                Undo::Remove { path, node } => tree.attach(&path, node),
            };
            debug_assert!(restored.is_ok(), "rollback must restore pre-batch state");
            if let Err(err) = restored {
                tracing::error!(error = %err, "rollback step failed");
            }
        }
    }

    /// Removes an expired node, if it is still the one the entry was
    /// armed against. Returns the commit version, or `None` when the
    /// entry was stale (node gone or re-set since).
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the journal write fails; the node stays in place.
    pub fn execute_expiry(
        &self,
        path: &str,
        node_version: u64,
    ) -> Result<Option<u64>, ConfigError> {
        let parsed = TreePath::parse(path)?;
        let mut tree = self.tree.write();

        let Ok(info) = tree.lookup(&parsed) else {
            return Ok(None);
        };
        if info.version != node_version || info.expiry_ms.is_none() {
            return Ok(None);
        }

        let tentative = tree.version() + 1;
        let node = tree.remove(&parsed)?;
        let set = ChangeSet {
            version: tentative,
            commit_ms: self.clock.now_ms(),
            events: vec![ChangeEvent {
                path: path.to_string(),
                kind: ChangeKind::Expired,
                value: None,
                expiry_ms: None,
            }],
        };
        if let Err(error) = self.journal.lock().append(&set) {
            let restored = tree.attach(&parsed, node);
            debug_assert!(restored.is_ok());
            return Err(error);
        }
        tree.set_version(tentative);
        self.bus.publish(&set);
        Ok(Some(tentative))
    }

    /// Re-arms every persisted TTL after recovery.
    pub fn arm_recovered_expiries(&self) {
        let tree = self.tree.read();
        let mut armed = 0usize;
        tree.for_each_expiring(|path, fire_ms, version| {
            self.expiry.arm(path.to_string(), fire_ms, version);
            armed += 1;
        });
        if armed > 0 {
            tracing::info!(armed, "re-armed persisted expiries");
        }
    }

    /// Deep copy of the live tree, for the compactor.
    #[must_use]
    pub fn clone_tree(&self) -> PropertyTree {
        self.tree.read().clone()
    }

    /// Current journal size.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the journal cannot be stat'ed.
    pub fn journal_len(&self) -> Result<u64, ConfigError> {
        self.journal.lock().len_bytes()
    }

    /// Snapshots the tree and drops the journal prefix the snapshot
    /// subsumes. Writers stall only for the in-memory clone.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when the snapshot write or journal rewrite fails.
    pub fn compact(&self, store: &crate::store::SnapshotStore) -> Result<(), ConfigError> {
        let view = self.clone_tree();
        let version = view.version();
        store.write(&view)?;
        self.journal.lock().rotate(version)?;
        tracing::info!(version, "compacted snapshot and journal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cfgplane_core::{ErrorKind, SystemClock};
    use tempfile::TempDir;

    use super::*;
    use crate::notify::{KindFilter, Notification, SubscriptionHandle};

    struct FixedClock(i64);
    impl ClockSource for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0
        }
    }

    struct Harness {
        engine: Arc<ConfigEngine>,
        bus: Arc<NotificationBus>,
        expiry: Arc<ExpirySchedule>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        harness_with_clock(Arc::new(SystemClock))
    }

    fn harness_with_clock(clock: Arc<dyn ClockSource>) -> Harness {
        let dir = TempDir::new().unwrap();
        let (tree, journal, _) = crate::store::recover(dir.path()).unwrap();
        let bus = Arc::new(NotificationBus::new(64));
        let expiry = Arc::new(ExpirySchedule::new());
        let engine = Arc::new(ConfigEngine::new(
            tree,
            journal,
            Arc::new(Validator::with_baseline()),
            Arc::clone(&bus),
            Arc::clone(&expiry),
            clock,
        ));
        Harness {
            engine,
            bus,
            expiry,
            _dir: dir,
        }
    }

    fn operator_batch() -> Batch {
        Batch::new("test", LEVEL_OPERATOR)
    }

    #[test]
    fn create_then_conflict() {
        let h = harness();

        let outcome = h
            .engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
            .unwrap();
        assert_eq!(outcome.version, Some(1));

        let err = h
            .engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Exists);
        assert_eq!(err.ordinal, Some(0));
        assert_eq!(h.engine.version(), 1);

        let outcome = h
            .engine
            .execute(&operator_batch().get("@/rings/guest/vlan"))
            .unwrap();
        assert!(outcome.reply.contains("40"));
        assert_eq!(outcome.version, None);
    }

    #[test]
    fn failing_batch_rolls_back_every_effect() {
        let h = harness();

        let err = h
            .engine
            .execute(
                &operator_batch()
                    .create("@/rings/a/vlan", "1", None)
                    .create("@/rings/a/vlan", "2", None),
            )
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Exists);
        assert_eq!(err.ordinal, Some(1));

        // The first create was rolled back with the second's failure.
        let err = h
            .engine
            .execute(&operator_batch().get("@/rings/a/vlan"))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::NotFound);
        assert_eq!(h.engine.version(), 0);
    }

    #[test]
    fn rollback_restores_replaced_and_deleted_state() {
        let h = harness();
        h.engine
            .execute(
                &operator_batch()
                    .create("@/rings/guest/vlan", "40", None)
                    .create("@/rings/guest/bridge", "br40", None),
            )
            .unwrap();

        // set + delete succeed, then testeq fails; everything reverts.
        let err = h
            .engine
            .execute(
                &operator_batch()
                    .set("@/rings/guest/vlan", "41", None)
                    .delete("@/rings/guest/bridge")
                    .test_eq("@/rings/guest/vlan", "999"),
            )
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Mismatch);
        assert_eq!(err.ordinal, Some(2));

        let outcome = h
            .engine
            .execute(
                &operator_batch()
                    .get("@/rings/guest/vlan")
                    .get("@/rings/guest/bridge"),
            )
            .unwrap();
        assert!(outcome.reply.contains("40"));
        assert!(outcome.reply.contains("br40"));
    }

    #[test]
    fn validation_gates_writes() {
        let h = harness();
        h.engine
            .validator()
            .register_setting(
                cfgplane_core::ValidationRule::new(
                    "@/settings/sampler/cap-time",
                    cfgplane_core::ValueType::Duration,
                )
                .unwrap(),
            )
            .unwrap();

        let err = h
            .engine
            .execute(&operator_batch().create("@/settings/sampler/cap-time", "30x", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Validation);

        h.engine
            .execute(&operator_batch().create("@/settings/sampler/cap-time", "30s", None))
            .unwrap();

        let err = h
            .engine
            .execute(&operator_batch().set("@/settings/sampler/cap-time", "30x", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Validation);

        h.engine
            .execute(&operator_batch().set("@/settings/sampler/cap-time", "45m", None))
            .unwrap();
    }

    #[test]
    fn unmatched_path_is_rejected() {
        let h = harness();
        let err = h
            .engine
            .execute(&operator_batch().create("@/not-a-subtree/x", "1", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Validation);
    }

    #[test]
    fn bad_path_reports_badpath() {
        let h = harness();
        let err = h
            .engine
            .execute(&operator_batch().get("rings/guest"))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::BadPath);
    }

    #[test]
    fn reply_concatenates_gets_in_order() {
        let h = harness();
        h.engine
            .execute(
                &operator_batch()
                    .create("@/rings/guest/vlan", "40", None)
                    .create("@/rings/core/vlan", "10", None),
            )
            .unwrap();

        let outcome = h
            .engine
            .execute(
                &operator_batch()
                    .get("@/rings/guest/vlan")
                    .get("@/rings/core/vlan"),
            )
            .unwrap();
        let guest = outcome.reply.find("40").unwrap();
        let core = outcome.reply.find("10").unwrap();
        assert!(guest < core);
    }

    #[test]
    fn versions_are_dense_across_commits() {
        let h = harness();
        for (i, ring) in ["a", "b", "c"].iter().enumerate() {
            let outcome = h
                .engine
                .execute(&operator_batch().create(format!("@/rings/{ring}/vlan"), "1", None))
                .unwrap();
            assert_eq!(outcome.version, Some(i as u64 + 1));
        }
    }

    #[test]
    fn low_access_level_cannot_mutate() {
        let h = harness();
        let err = h
            .engine
            .execute(&Batch::new("probe", 0).create("@/rings/guest/vlan", "40", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Unauthorized);

        // Reads are fine at any level once state exists.
        h.engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
            .unwrap();
        h.engine
            .execute(&Batch::new("probe", 0).get("@/rings/guest/vlan"))
            .unwrap();
    }

    #[test]
    fn user_secrets_need_internal_level() {
        let h = harness();
        let err = h
            .engine
            .execute(&operator_batch().create("@/users/jdoe/userPassword", "opaque", None))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Unauthorized);

        h.engine
            .execute(
                &Batch::new("userauthd", LEVEL_INTERNAL).create(
                    "@/users/jdoe/userPassword",
                    "opaque",
                    None,
                ),
            )
            .unwrap();
        // Non-secret user properties stay writable at operator level.
        h.engine
            .execute(&operator_batch().create("@/users/jdoe/displayName", "J. Doe", None))
            .unwrap();
    }

    #[test]
    fn commit_arms_expiry_entries() {
        let h = harness();
        h.engine
            .execute(&operator_batch().create(
                "@/clients/aa:bb:cc:dd:ee:ff/ipv4",
                "10.0.0.5",
                Some(9_000),
            ))
            .unwrap();
        assert_eq!(h.expiry.len(), 1);
        assert_eq!(h.expiry.next_fire_ms(), Some(9_000));
    }

    #[test]
    fn execute_expiry_removes_node_and_tags_expired() {
        let h = harness_with_clock(Arc::new(FixedClock(10_000)));
        let mut sub: SubscriptionHandle = h
            .bus
            .subscribe(r"^@/clients/.*/ipv4$", KindFilter::expire_only())
            .unwrap();

        h.engine
            .execute(&operator_batch().create(
                "@/clients/aa:bb:cc:dd:ee:ff/ipv4",
                "10.0.0.5",
                Some(9_000),
            ))
            .unwrap();

        let fired = h
            .engine
            .execute_expiry("@/clients/aa:bb:cc:dd:ee:ff/ipv4", 1)
            .unwrap();
        assert_eq!(fired, Some(2));

        let err = h
            .engine
            .execute(&operator_batch().get("@/clients/aa:bb:cc:dd:ee:ff/ipv4"))
            .unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::NotFound);

        match sub.try_recv().unwrap() {
            Notification::Event { event, .. } => {
                assert_eq!(event.kind, ChangeKind::Expired);
                assert_eq!(event.path, "@/clients/aa:bb:cc:dd:ee:ff/ipv4");
            }
            Notification::Resync { .. } => panic!("unexpected resync"),
        }
    }

    #[test]
    fn stale_expiry_entry_is_discarded() {
        let h = harness();
        h.engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", Some(5_000)))
            .unwrap();
        // Re-set bumps the node version; the old entry no longer applies.
        h.engine
            .execute(&operator_batch().set("@/rings/guest/vlan", "41", None))
            .unwrap();

        let fired = h.engine.execute_expiry("@/rings/guest/vlan", 1).unwrap();
        assert_eq!(fired, None);
        assert_eq!(h.engine.version(), 2);

        // Entirely missing nodes are also silent.
        let fired = h.engine.execute_expiry("@/rings/gone/vlan", 7).unwrap();
        assert_eq!(fired, None);
    }

    #[test]
    fn committed_batches_notify_in_commit_order() {
        let h = harness();
        let mut sub = h
            .bus
            .subscribe(r"^@/rings/.*$", KindFilter::all())
            .unwrap();

        h.engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
            .unwrap();
        h.engine
            .execute(&operator_batch().set("@/rings/guest/vlan", "41", None))
            .unwrap();
        h.engine
            .execute(&operator_batch().delete("@/rings/guest/vlan"))
            .unwrap();

        let versions: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|notification| match notification {
                Notification::Event { version, .. } => version,
                Notification::Resync { .. } => panic!("unexpected resync"),
            })
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn failed_batch_emits_no_notifications() {
        let h = harness();
        let mut sub = h.bus.subscribe(r"^@/.*$", KindFilter::all()).unwrap();

        let _ = h
            .engine
            .execute(
                &operator_batch()
                    .create("@/rings/a/vlan", "1", None)
                    .create("@/rings/a/vlan", "2", None),
            )
            .unwrap_err();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn idempotent_guarded_create() {
        let h = harness();
        let guarded = || {
            operator_batch()
                .test("@/rings/guest/vlan")
                .set("@/rings/guest/vlan", "40", None)
        };

        // First application: the guard fails, nothing changes.
        let err = h.engine.execute(&guarded()).unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::NotFound);
        assert_eq!(err.ordinal, Some(0));

        h.engine
            .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
            .unwrap();

        // Applying the guarded update twice leaves the same tree.
        h.engine.execute(&guarded()).unwrap();
        let first = h.engine.clone_tree();
        h.engine.execute(&guarded()).unwrap();
        let second = h.engine.clone_tree();
        assert_eq!(
            first
                .lookup(&TreePath::parse("@/rings/guest/vlan").unwrap())
                .unwrap()
                .value,
            second
                .lookup(&TreePath::parse("@/rings/guest/vlan").unwrap())
                .unwrap()
                .value,
        );
    }

    #[test]
    fn tree_matches_journal_replay() {
        let dir = TempDir::new().unwrap();
        {
            let (tree, journal, _) = crate::store::recover(dir.path()).unwrap();
            let engine = ConfigEngine::new(
                tree,
                journal,
                Arc::new(Validator::with_baseline()),
                Arc::new(NotificationBus::new(16)),
                Arc::new(ExpirySchedule::new()),
                Arc::new(SystemClock),
            );
            engine
                .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
                .unwrap();
            engine
                .execute(&operator_batch().set("@/rings/guest/vlan", "41", None))
                .unwrap();
            engine
                .execute(&operator_batch().create("@/rings/core/vlan", "10", None))
                .unwrap();
            engine
                .execute(&operator_batch().delete("@/rings/core"))
                .unwrap();

            // Crash here: nothing snapshotted, journal has it all.
        }

        let (tree, _journal, report) = crate::store::recover(dir.path()).unwrap();
        assert_eq!(report.replayed, 4);
        assert_eq!(tree.version(), 4);
        assert_eq!(
            tree.lookup(&TreePath::parse("@/rings/guest/vlan").unwrap())
                .unwrap()
                .value
                .as_deref(),
            Some("41")
        );
        assert!(tree
            .lookup(&TreePath::parse("@/rings/core").unwrap())
            .is_err());
    }

    #[test]
    fn compaction_preserves_recovery() {
        let dir = TempDir::new().unwrap();
        let snap = crate::store::SnapshotStore::new(dir.path().join(crate::store::SNAPSHOT_FILE));
        {
            let (tree, journal, _) = crate::store::recover(dir.path()).unwrap();
            let engine = ConfigEngine::new(
                tree,
                journal,
                Arc::new(Validator::with_baseline()),
                Arc::new(NotificationBus::new(16)),
                Arc::new(ExpirySchedule::new()),
                Arc::new(SystemClock),
            );
            engine
                .execute(&operator_batch().create("@/rings/guest/vlan", "40", None))
                .unwrap();
            engine.compact(&snap).unwrap();
            engine
                .execute(&operator_batch().set("@/rings/guest/vlan", "41", None))
                .unwrap();
        }

        let (tree, _journal, report) = crate::store::recover(dir.path()).unwrap();
        // Only the post-snapshot commit replays.
        assert_eq!(report.replayed, 1);
        assert_eq!(tree.version(), 2);
        assert_eq!(
            tree.lookup(&TreePath::parse("@/rings/guest/vlan").unwrap())
                .unwrap()
                .value
                .as_deref(),
            Some("41")
        );
    }

    #[test]
    fn arm_recovered_expiries_rebuilds_schedule() {
        let dir = TempDir::new().unwrap();
        {
            let (tree, journal, _) = crate::store::recover(dir.path()).unwrap();
            let engine = ConfigEngine::new(
                tree,
                journal,
                Arc::new(Validator::with_baseline()),
                Arc::new(NotificationBus::new(16)),
                Arc::new(ExpirySchedule::new()),
                Arc::new(SystemClock),
            );
            engine
                .execute(&operator_batch().create(
                    "@/clients/aa:bb:cc:dd:ee:ff/ipv4",
                    "10.0.0.5",
                    Some(99_000),
                ))
                .unwrap();
        }

        let (tree, journal, _) = crate::store::recover(dir.path()).unwrap();
        let expiry = Arc::new(ExpirySchedule::new());
        let engine = ConfigEngine::new(
            tree,
            journal,
            Arc::new(Validator::with_baseline()),
            Arc::new(NotificationBus::new(16)),
            Arc::clone(&expiry),
            Arc::new(SystemClock),
        );
        engine.arm_recovered_expiries();
        assert_eq!(expiry.len(), 1);
        assert_eq!(expiry.next_fire_ms(), Some(99_000));
    }

    #[test]
    fn setting_reads_runtime_leaf() {
        let h = harness();
        h.engine
            .validator()
            .register_setting(
                cfgplane_core::ValidationRule::new(
                    "@/settings/cfgd/recv_timeout",
                    cfgplane_core::ValueType::Int,
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(h.engine.setting("cfgd", "recv_timeout"), None);

        h.engine
            .execute(&operator_batch().create("@/settings/cfgd/recv_timeout", "45000", None))
            .unwrap();
        assert_eq!(
            h.engine.setting("cfgd", "recv_timeout").as_deref(),
            Some("45000")
        );
    }
}
