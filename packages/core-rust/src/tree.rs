//! The versioned hierarchical property store.
//!
//! [`PropertyTree`] owns every node. Mutation happens only through the
//! transaction engine, which calls the operations here under the tree's
//! write lock; readers receive deep, immutable [`Subtree`] snapshots and
//! never hold references into live tree memory.
//!
//! Invariants maintained here:
//! - a node with children never holds a value (leaf/interior exclusivity);
//! - every mutated node records the version of the committing batch;
//! - the tree `version` equals the version of the last applied batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::changes::{ChangeKind, ChangeSet};
use crate::error::ConfigError;
use crate::path::TreePath;

/// One node of the property tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyNode {
    /// Leaf value. `None` for interior nodes.
    pub value: Option<String>,
    /// Absolute wall-clock expiry in milliseconds since the Unix epoch.
    pub expiry_ms: Option<i64>,
    /// Version of the batch that last mutated this node.
    pub version: u64,
    /// Child nodes keyed by label.
    pub children: BTreeMap<String, PropertyNode>,
}

impl PropertyNode {
    fn interior(version: u64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    fn leaf(value: String, expiry_ms: Option<i64>, version: u64) -> Self {
        Self {
            value: Some(value),
            expiry_ms,
            version,
            children: BTreeMap::new(),
        }
    }

    /// `true` when the node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Read result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub value: Option<String>,
    pub expiry_ms: Option<i64>,
    pub version: u64,
    /// Labels of the node's immediate children.
    pub children: Vec<String>,
}

/// A deep, immutable snapshot of a tree region.
///
/// Serialises to the JSON export format consumed by `cfgctl export` and
/// produced by `get` replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtree {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiry_ms: Option<i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub children: BTreeMap<String, Subtree>,
}

impl From<&PropertyNode> for Subtree {
    fn from(node: &PropertyNode) -> Self {
        Self {
            value: node.value.clone(),
            expiry_ms: node.expiry_ms,
            children: node
                .children
                .iter()
                .map(|(label, child)| (label.clone(), Subtree::from(child)))
                .collect(),
        }
    }
}

/// Outcome of a successful [`PropertyTree::insert`], kept for rollback.
///
/// `created_root` is the topmost node the insert created; removing it
/// undoes the whole insert, including any interior nodes fabricated on
/// the way down.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub created_root: TreePath,
}

/// Prior leaf state captured by [`PropertyTree::replace`] for rollback.
#[derive(Debug, Clone)]
pub struct Replaced {
    pub value: String,
    pub expiry_ms: Option<i64>,
    pub version: u64,
}

/// The rooted property tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyTree {
    root: PropertyNode,
    version: u64,
}

impl Default for PropertyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyTree {
    /// An empty tree at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PropertyNode::default(),
            version: 0,
        }
    }

    /// Version of the last applied batch.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records a committed batch version. Called by the transaction engine
    /// after the journal write succeeds.
    pub fn set_version(&mut self, version: u64) {
        debug_assert!(version > self.version, "tree version must be monotonic");
        self.version = version;
    }

    fn node(&self, path: &TreePath) -> Option<&PropertyNode> {
        let mut cursor = &self.root;
        for label in &path.labels()[1..] {
            cursor = cursor.children.get(label)?;
        }
        Some(cursor)
    }

    fn node_mut(&mut self, path: &TreePath) -> Option<&mut PropertyNode> {
        let mut cursor = &mut self.root;
        for label in &path.labels()[1..] {
            cursor = cursor.children.get_mut(label)?;
        }
        Some(cursor)
    }

    /// Creates a new leaf, fabricating missing interior nodes.
    ///
    /// # Errors
    ///
    /// `EXISTS` if any node already sits at `path`; `NOTLEAF` if an
    /// ancestor on the way down is a leaf.
    pub fn insert(
        &mut self,
        path: &TreePath,
        value: String,
        expiry_ms: Option<i64>,
        version: u64,
    ) -> Result<Inserted, ConfigError> {
        if path.is_root() {
            return Err(ConfigError::Exists {
                path: path.to_string(),
            });
        }

        let labels = path.labels();
        let mut cursor = &mut self.root;
        let mut walked = TreePath::root();
        let mut created_root: Option<TreePath> = None;

        for label in &labels[1..labels.len() - 1] {
            if cursor.value.is_some() {
                return Err(ConfigError::NotLeaf {
                    path: walked.to_string(),
                });
            }
            walked = walked.join(label)?;
            if !cursor.children.contains_key(label) {
                cursor
                    .children
                    .insert(label.clone(), PropertyNode::interior(version));
                created_root.get_or_insert_with(|| walked.clone());
            }
            cursor = cursor
                .children
                .get_mut(label)
                .unwrap_or_else(|| unreachable!("child inserted above"));
        }

        if cursor.value.is_some() {
            return Err(ConfigError::NotLeaf {
                path: walked.to_string(),
            });
        }
        let leaf_label = path.leaf_label();
        if !cursor.children.contains_key(leaf_label) {
            cursor.children.insert(
                leaf_label.to_string(),
                PropertyNode::leaf(value, expiry_ms, version),
            );
            return Ok(Inserted {
                created_root: created_root.unwrap_or_else(|| path.clone()),
            });
        }

        // The target already exists. Its parent therefore pre-existed the
        // call, which means nothing was fabricated on the way down.
        debug_assert!(created_root.is_none());
        Err(ConfigError::Exists {
            path: path.to_string(),
        })
    }

    /// Replaces the value of an existing leaf, returning the prior state.
    ///
    /// # Errors
    ///
    /// `NOTFOUND` if no node sits at `path`; `NOTLEAF` if the node has
    /// children.
    pub fn replace(
        &mut self,
        path: &TreePath,
        value: String,
        expiry_ms: Option<i64>,
        version: u64,
    ) -> Result<Replaced, ConfigError> {
        let node = self.node_mut(path).ok_or_else(|| ConfigError::NotFound {
            path: path.to_string(),
        })?;
        if !node.children.is_empty() {
            return Err(ConfigError::NotLeaf {
                path: path.to_string(),
            });
        }
        let old = Replaced {
            value: node.value.clone().unwrap_or_default(),
            expiry_ms: node.expiry_ms,
            version: node.version,
        };
        node.value = Some(value);
        node.expiry_ms = expiry_ms;
        node.version = version;
        Ok(old)
    }

    /// Removes a node and its whole subtree, returning the detached node.
    ///
    /// Removing a non-empty interior node is permitted; removing the root
    /// is not.
    ///
    /// # Errors
    ///
    /// `NOTFOUND` if no node sits at `path`; `BADPATH` for the root.
    pub fn remove(&mut self, path: &TreePath) -> Result<PropertyNode, ConfigError> {
        if path.is_root() {
            return Err(ConfigError::BadPath {
                path: path.to_string(),
                reason: "root cannot be removed".to_string(),
            });
        }
        self.detach(path).ok_or_else(|| ConfigError::NotFound {
            path: path.to_string(),
        })
    }

    fn detach(&mut self, path: &TreePath) -> Option<PropertyNode> {
        let parent = path.parent()?;
        let parent_node = self.node_mut(&parent)?;
        parent_node.children.remove(path.leaf_label())
    }

    /// Re-attaches a previously detached node. Rollback counterpart of
    /// [`PropertyTree::remove`]; the parent chain must still exist.
    pub fn attach(&mut self, path: &TreePath, node: PropertyNode) -> Result<(), ConfigError> {
        let parent = path.parent().ok_or_else(|| ConfigError::BadPath {
            path: path.to_string(),
            reason: "root cannot be attached".to_string(),
        })?;
        let parent_node = self
            .node_mut(&parent)
            .ok_or_else(|| ConfigError::NotFound {
                path: parent.to_string(),
            })?;
        parent_node.children.insert(path.leaf_label().to_string(), node);
        Ok(())
    }

    /// Reads a single node.
    ///
    /// # Errors
    ///
    /// `NOTFOUND` if no node sits at `path`.
    pub fn lookup(&self, path: &TreePath) -> Result<NodeInfo, ConfigError> {
        let node = self.node(path).ok_or_else(|| ConfigError::NotFound {
            path: path.to_string(),
        })?;
        Ok(NodeInfo {
            value: node.value.clone(),
            expiry_ms: node.expiry_ms,
            version: node.version,
            children: node.children.keys().cloned().collect(),
        })
    }

    /// Deep snapshot of the subtree rooted at `path`.
    ///
    /// # Errors
    ///
    /// `NOTFOUND` if no node sits at `path`.
    pub fn export(&self, path: &TreePath) -> Result<Subtree, ConfigError> {
        let node = self.node(path).ok_or_else(|| ConfigError::NotFound {
            path: path.to_string(),
        })?;
        Ok(Subtree::from(node))
    }

    /// Creates or overwrites a leaf without the exclusivity pre-checks a
    /// live mutation gets. Journal-replay primitive: committed change sets
    /// are internally consistent, so the only surprise worth rejecting is
    /// a value landing on an interior node.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when replay would put a value on a node with children.
    pub fn upsert(
        &mut self,
        path: &TreePath,
        value: Option<String>,
        expiry_ms: Option<i64>,
        version: u64,
    ) -> Result<(), ConfigError> {
        let labels = path.labels();
        let mut cursor = &mut self.root;
        for label in &labels[1..] {
            cursor = cursor
                .children
                .entry(label.clone())
                .or_insert_with(|| PropertyNode::interior(version));
        }
        if value.is_some() && !cursor.children.is_empty() {
            return Err(ConfigError::Corrupt {
                reason: format!("replayed value for interior node {path}"),
            });
        }
        cursor.value = value;
        cursor.expiry_ms = expiry_ms;
        cursor.version = version;
        Ok(())
    }

    /// Applies one committed change set during journal replay.
    ///
    /// # Errors
    ///
    /// `CORRUPT` when an event is inconsistent with the tree built so far.
    pub fn apply_changeset(&mut self, set: &ChangeSet) -> Result<(), ConfigError> {
        for event in &set.events {
            let path = TreePath::parse(&event.path)?;
            match event.kind {
                ChangeKind::Updated => {
                    self.upsert(&path, event.value.clone(), event.expiry_ms, set.version)?;
                }
                ChangeKind::Deleted | ChangeKind::Expired => {
                    // Replaying a delete of a node a later snapshot already
                    // dropped is fine.
                    let _ = self.detach(&path);
                }
            }
        }
        self.version = set.version;
        Ok(())
    }

    /// Visits every node that carries an expiry, in path order.
    pub fn for_each_expiring<F: FnMut(&str, i64, u64)>(&self, mut visit: F) {
        fn walk<F: FnMut(&str, i64, u64)>(node: &PropertyNode, path: &str, visit: &mut F) {
            if let Some(fire_ms) = node.expiry_ms {
                visit(path, fire_ms, node.version);
            }
            for (label, child) in &node.children {
                walk(child, &format!("{path}/{label}"), visit);
            }
        }
        walk(&self.root, crate::path::ROOT_LABEL, &mut visit);
    }
}
