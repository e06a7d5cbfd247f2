//! `cfgplane` Core -- property tree, schema validation, change sets, and wire schemas.
//!
//! This crate provides the data-plane foundation for the configuration plane:
//!
//! - **Paths** ([`path`]): validated `@`-rooted tree paths
//! - **Tree** ([`tree`]): the versioned hierarchical property store
//! - **Schema** ([`schema`]): `Validator`, `ValidationRule`, value types
//! - **Changes** ([`changes`]): `ChangeSet` / `ChangeEvent`, unit of notification
//! - **Wire** ([`wire`]): `Batch`, `Reply`, MsgPack encode/decode
//! - **Errors** ([`error`]): `ConfigError` taxonomy and wire `ErrorKind`
//! - **Clock** ([`clock`]): injectable wall-clock source for expiry handling

pub mod changes;
pub mod clock;
pub mod error;
pub mod path;
pub mod schema;
pub mod tree;
pub mod wire;

// Changes
pub use changes::{ChangeEvent, ChangeKind, ChangeSet};

// Clock
pub use clock::{ClockSource, SystemClock};

// Errors
pub use error::{ConfigError, ErrorKind};

// Paths
pub use path::TreePath;

// Schema
pub use schema::{ValidationRule, Validator, ValueType};

// Tree
pub use tree::{NodeInfo, PropertyNode, PropertyTree, Subtree};

// Wire
pub use wire::{Batch, OpKind, Reply, WireOp, APVERSION, APVERSION_PATH};
