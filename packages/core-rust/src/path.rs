//! Tree path parsing and validation.
//!
//! Every property in the tree is addressed by a `/`-separated, `@`-rooted
//! path such as `@/clients/aa:bb:cc:dd:ee:ff/ipv4`. Paths are UTF-8 and
//! case-sensitive. Parsing rejects empty labels, a missing `@` root, paths
//! deeper than [`MAX_DEPTH`] labels, and paths longer than [`MAX_BYTES`]
//! bytes, all with [`ConfigError::BadPath`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum number of labels in a path, including the `@` root.
pub const MAX_DEPTH: usize = 64;

/// Maximum encoded length of a path in bytes.
pub const MAX_BYTES: usize = 1024;

/// The root label every path starts with.
pub const ROOT_LABEL: &str = "@";

/// A validated, owned tree path.
///
/// Construction always goes through [`TreePath::parse`], so holding a
/// `TreePath` is proof the path is well-formed. `Display` reproduces the
/// original `@/a/b` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath {
    labels: Vec<String>,
}

impl TreePath {
    /// Parses and validates a path string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadPath`] when the path is empty, not rooted
    /// at `@`, contains an empty label, exceeds [`MAX_DEPTH`] labels, or
    /// exceeds [`MAX_BYTES`] bytes.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::BadPath {
            path: text.to_string(),
            reason: reason.to_string(),
        };

        if text.is_empty() {
            return Err(bad("empty path"));
        }
        if text.len() > MAX_BYTES {
            return Err(bad("path exceeds 1024 bytes"));
        }

        let labels: Vec<String> = text.split('/').map(str::to_string).collect();
        if labels[0] != ROOT_LABEL {
            return Err(bad("path must be rooted at @"));
        }
        if labels.len() > MAX_DEPTH {
            return Err(bad("path exceeds 64 labels"));
        }
        if labels.iter().skip(1).any(String::is_empty) {
            return Err(bad("empty label"));
        }

        Ok(Self { labels })
    }

    /// Returns the root path `@`.
    #[must_use]
    pub fn root() -> Self {
        Self {
            labels: vec![ROOT_LABEL.to_string()],
        }
    }

    /// The labels of this path, `@` first.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of labels, including the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.labels.len()
    }

    /// `true` for the bare root path `@`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.labels.len() == 1
    }

    /// The final label of the path.
    #[must_use]
    pub fn leaf_label(&self) -> &str {
        self.labels.last().map_or(ROOT_LABEL, String::as_str)
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            labels: self.labels[..self.labels.len() - 1].to_vec(),
        })
    }

    /// Extends the path with one more label.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadPath`] if the label is empty, contains `/`,
    /// or the result would exceed the depth or length caps.
    pub fn join(&self, label: &str) -> Result<Self, ConfigError> {
        if label.is_empty() || label.contains('/') {
            return Err(ConfigError::BadPath {
                path: format!("{self}/{label}"),
                reason: "invalid label".to_string(),
            });
        }
        let mut labels = self.labels.clone();
        labels.push(label.to_string());
        let joined = Self { labels };
        if joined.depth() > MAX_DEPTH || joined.to_string().len() > MAX_BYTES {
            return Err(ConfigError::BadPath {
                path: joined.to_string(),
                reason: "path exceeds size limits".to_string(),
            });
        }
        Ok(joined)
    }

    /// `true` when `prefix` is this path or an ancestor of it.
    #[must_use]
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        prefix.labels.len() <= self.labels.len()
            && self.labels[..prefix.labels.len()] == prefix.labels[..]
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels.join("/"))
    }
}

impl FromStr for TreePath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TreePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TreePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Deepest common ancestor of two path strings.
///
/// Both inputs must be well-formed paths; malformed input degrades to `@`.
/// Used to coalesce missed notification paths into a single resync root.
#[must_use]
pub fn common_ancestor(a: &str, b: &str) -> String {
    let shared: Vec<&str> = a
        .split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    if shared.is_empty() {
        ROOT_LABEL.to_string()
    } else {
        shared.join("/")
    }
}
