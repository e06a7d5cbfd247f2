//! Error taxonomy shared by every layer of the configuration plane.
//!
//! [`ConfigError`] carries the context a caller needs for diagnostics;
//! [`ErrorKind`] is the flat wire code that travels in a [`Reply`]
//! (`crate::wire::Reply`). A batch either fully succeeds or fails with
//! exactly one kind plus the ordinal of the failing operation.

use serde::{Deserialize, Serialize};

/// Rich error type for configuration plane operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no node at {path}")]
    NotFound { path: String },
    #[error("node already exists at {path}")]
    Exists { path: String },
    #[error("{path} is not a leaf")]
    NotLeaf { path: String },
    #[error("malformed path {path}: {reason}")]
    BadPath { path: String, reason: String },
    #[error("validation failed at {path}: {reason}")]
    Validation { path: String, reason: String },
    #[error("value mismatch at {path}")]
    Mismatch { path: String },
    #[error("persistent state corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("operation timed out")]
    Timeout,
    #[error("daemon is shutting down")]
    ShuttingDown,
    #[error("transport failure: {reason}")]
    Transport { reason: String },
    #[error("caller not authorized")]
    Unauthorized,
    #[error("resource busy")]
    Busy,
}

impl ConfigError {
    /// The flat wire code for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Exists { .. } => ErrorKind::Exists,
            Self::NotLeaf { .. } => ErrorKind::NotLeaf,
            Self::BadPath { .. } => ErrorKind::BadPath,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Mismatch { .. } => ErrorKind::Mismatch,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Timeout => ErrorKind::Timeout,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Busy => ErrorKind::Busy,
        }
    }
}

/// Flat error code carried on the wire.
///
/// `Ok` marks a successful reply; every other variant maps 1:1 onto a
/// [`ConfigError`] family. Wire names are the historical SCREAMING forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOTFOUND")]
    NotFound,
    #[serde(rename = "EXISTS")]
    Exists,
    #[serde(rename = "NOTLEAF")]
    NotLeaf,
    #[serde(rename = "BADPATH")]
    BadPath,
    #[serde(rename = "VALIDATION")]
    Validation,
    #[serde(rename = "MISMATCH")]
    Mismatch,
    #[serde(rename = "CORRUPT")]
    Corrupt,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "SHUTTING_DOWN")]
    ShuttingDown,
    #[serde(rename = "TRANSPORT")]
    Transport,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "BUSY")]
    Busy,
}

impl ErrorKind {
    /// The wire spelling of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotFound => "NOTFOUND",
            Self::Exists => "EXISTS",
            Self::NotLeaf => "NOTLEAF",
            Self::BadPath => "BADPATH",
            Self::Validation => "VALIDATION",
            Self::Mismatch => "MISMATCH",
            Self::Corrupt => "CORRUPT",
            Self::Timeout => "TIMEOUT",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Transport => "TRANSPORT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Busy => "BUSY",
        }
    }
}

impl ErrorKind {
    /// Reconstructs a context-free [`ConfigError`] from a wire code, or
    /// `None` for `Ok`. Used by clients turning a failure reply back into
    /// a typed error.
    #[must_use]
    pub fn to_error(self) -> Option<ConfigError> {
        let err = match self {
            Self::Ok => return None,
            Self::NotFound => ConfigError::NotFound {
                path: String::new(),
            },
            Self::Exists => ConfigError::Exists {
                path: String::new(),
            },
            Self::NotLeaf => ConfigError::NotLeaf {
                path: String::new(),
            },
            Self::BadPath => ConfigError::BadPath {
                path: String::new(),
                reason: String::new(),
            },
            Self::Validation => ConfigError::Validation {
                path: String::new(),
                reason: String::new(),
            },
            Self::Mismatch => ConfigError::Mismatch {
                path: String::new(),
            },
            Self::Corrupt => ConfigError::Corrupt {
                reason: String::new(),
            },
            Self::Timeout => ConfigError::Timeout,
            Self::ShuttingDown => ConfigError::ShuttingDown,
            Self::Transport => ConfigError::Transport {
                reason: String::new(),
            },
            Self::Unauthorized => ConfigError::Unauthorized,
            Self::Busy => ConfigError::Busy,
        };
        Some(err)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_variant() {
        let cases: Vec<(ConfigError, ErrorKind)> = vec![
            (
                ConfigError::NotFound { path: "@/x".into() },
                ErrorKind::NotFound,
            ),
            (
                ConfigError::Exists { path: "@/x".into() },
                ErrorKind::Exists,
            ),
            (
                ConfigError::NotLeaf { path: "@/x".into() },
                ErrorKind::NotLeaf,
            ),
            (
                ConfigError::BadPath {
                    path: "x".into(),
                    reason: "r".into(),
                },
                ErrorKind::BadPath,
            ),
            (
                ConfigError::Validation {
                    path: "@/x".into(),
                    reason: "r".into(),
                },
                ErrorKind::Validation,
            ),
            (
                ConfigError::Mismatch { path: "@/x".into() },
                ErrorKind::Mismatch,
            ),
            (
                ConfigError::Corrupt { reason: "r".into() },
                ErrorKind::Corrupt,
            ),
            (ConfigError::Timeout, ErrorKind::Timeout),
            (ConfigError::ShuttingDown, ErrorKind::ShuttingDown),
            (
                ConfigError::Transport { reason: "r".into() },
                ErrorKind::Transport,
            ),
            (ConfigError::Unauthorized, ErrorKind::Unauthorized),
            (ConfigError::Busy, ErrorKind::Busy),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn wire_names_match_taxonomy() {
        assert_eq!(ErrorKind::NotFound.as_str(), "NOTFOUND");
        assert_eq!(ErrorKind::ShuttingDown.as_str(), "SHUTTING_DOWN");
        let json = serde_json::to_string(&ErrorKind::NotLeaf).unwrap();
        assert_eq!(json, "\"NOTLEAF\"");
        let back: ErrorKind = serde_json::from_str("\"TESTEQ\"").map_or(ErrorKind::Ok, |k| k);
        // Unknown codes fail to parse rather than aliasing to a real kind.
        assert_eq!(back, ErrorKind::Ok);
    }

    #[test]
    fn display_is_wire_code() {
        assert_eq!(ErrorKind::Validation.to_string(), "VALIDATION");
    }
}
