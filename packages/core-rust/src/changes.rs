//! Change sets: the observable effect of one committed batch.
//!
//! A [`ChangeSet`] is emitted exactly once per successful transaction and
//! is immutable from then on. It is both the unit of notification (the bus
//! fans its events out to subscribers) and the unit of durability (the
//! journal is an append-only log of change sets).

use serde::{Deserialize, Serialize};

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A value was created or replaced.
    Updated,
    /// The node (and its subtree) was removed administratively.
    Deleted,
    /// The node was removed because its TTL fired.
    Expired,
}

/// One observable change at one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    /// New value for `Updated` events; absent for removals.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    /// New expiry for `Updated` events; absent for removals.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiry_ms: Option<i64>,
}

/// The committed effect of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Batch version; strictly monotonic per tree.
    pub version: u64,
    /// Wall-clock commit time in milliseconds since the Unix epoch.
    pub commit_ms: i64,
    /// Events in operation order.
    pub events: Vec<ChangeEvent>,
}
