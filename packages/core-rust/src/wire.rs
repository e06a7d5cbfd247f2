//! Serialised batch format shared by the appliance and the cloud.
//!
//! A [`Batch`] is an ordered sequence of typed operations plus sender
//! identity and access level; a [`Reply`] carries the concatenated `get`
//! output and the outcome. Wire encoding is self-describing MessagePack
//! (`rmp_serde::to_vec_named`), length-delimited by the transport. Both
//! ends agree on the tree schema version via `@/apversion`.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ErrorKind};

/// Schema version of the tree, stored at `@/apversion`. Readers refuse
/// persisted state written under a different version.
pub const APVERSION: &str = "2";

/// Path of the schema-version property.
pub const APVERSION_PATH: &str = "@/apversion";

/// Access level below which mutations are refused.
pub const LEVEL_OPERATOR: i32 = 10;

/// Access level required to write user secret properties.
pub const LEVEL_INTERNAL: i32 = 20;

/// Operation discriminant. Wire names are the historical SCREAMING forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "TEST")]
    Test,
    #[serde(rename = "TESTEQ")]
    TestEq,
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PING")]
    Ping,
}

impl OpKind {
    /// `true` for operations that can change the tree.
    #[must_use]
    pub fn mutates(self) -> bool {
        matches!(self, Self::Set | Self::Create | Self::Delete)
    }
}

/// One operation within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOp {
    pub op: OpKind,
    pub path: String,
    /// Value for `SET`/`CREATE`; expected value for `TESTEQ`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    /// Absolute expiry in milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires: Option<i64>,
}

/// An ordered batch of operations from one producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Identity of the producing daemon or service.
    pub sender: String,
    /// Privilege level of the producer.
    pub access_level: i32,
    pub ops: Vec<WireOp>,
}

impl Batch {
    /// Starts an empty batch for `sender` at `access_level`.
    #[must_use]
    pub fn new(sender: impl Into<String>, access_level: i32) -> Self {
        Self {
            sender: sender.into(),
            access_level,
            ops: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(mut self, path: impl Into<String>) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Get,
            path: path.into(),
            value: None,
            expires: None,
        });
        self
    }

    #[must_use]
    pub fn test(mut self, path: impl Into<String>) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Test,
            path: path.into(),
            value: None,
            expires: None,
        });
        self
    }

    #[must_use]
    pub fn test_eq(mut self, path: impl Into<String>, expected: impl Into<String>) -> Self {
        self.ops.push(WireOp {
            op: OpKind::TestEq,
            path: path.into(),
            value: Some(expected.into()),
            expires: None,
        });
        self
    }

    #[must_use]
    pub fn set(
        mut self,
        path: impl Into<String>,
        value: impl Into<String>,
        expires: Option<i64>,
    ) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Set,
            path: path.into(),
            value: Some(value.into()),
            expires,
        });
        self
    }

    #[must_use]
    pub fn create(
        mut self,
        path: impl Into<String>,
        value: impl Into<String>,
        expires: Option<i64>,
    ) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Create,
            path: path.into(),
            value: Some(value.into()),
            expires,
        });
        self
    }

    #[must_use]
    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Delete,
            path: path.into(),
            value: None,
            expires: None,
        });
        self
    }

    #[must_use]
    pub fn ping(mut self) -> Self {
        self.ops.push(WireOp {
            op: OpKind::Ping,
            path: crate::path::ROOT_LABEL.to_string(),
            value: None,
            expires: None,
        });
        self
    }

    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        encode(self)
    }

    /// Decodes from wire bytes.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when the bytes are not a valid batch.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        decode(bytes)
    }
}

/// Reply to one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Concatenation of `GET` results, in batch order.
    pub value: String,
    /// `OK` on success, otherwise the kind of the first failing op.
    pub err: ErrorKind,
    /// Ordinal of the failing op within the batch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub err_ordinal: Option<u32>,
}

impl Reply {
    /// A successful reply carrying the concatenated `get` output.
    #[must_use]
    pub fn ok(value: String) -> Self {
        Self {
            value,
            err: ErrorKind::Ok,
            err_ordinal: None,
        }
    }

    /// A failure reply.
    #[must_use]
    pub fn fail(err: ErrorKind, ordinal: Option<u32>) -> Self {
        Self {
            value: String::new(),
            err,
            err_ordinal: ordinal,
        }
    }

    /// `true` when the batch succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.err == ErrorKind::Ok
    }

    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        encode(self)
    }

    /// Decodes from wire bytes.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when the bytes are not a valid reply.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ConfigError> {
    rmp_serde::to_vec_named(msg).map_err(|err| ConfigError::Transport {
        reason: format!("encode: {err}"),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ConfigError> {
    rmp_serde::from_slice(bytes).map_err(|err| ConfigError::Transport {
        reason: format!("decode: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_builder_preserves_op_order() {
        let batch = Batch::new("cfgctl", LEVEL_OPERATOR)
            .test("@/rings/guest")
            .create("@/rings/guest/vlan", "40", None)
            .get("@/rings");
        assert_eq!(batch.ops.len(), 3);
        assert_eq!(batch.ops[0].op, OpKind::Test);
        assert_eq!(batch.ops[1].op, OpKind::Create);
        assert_eq!(batch.ops[1].value.as_deref(), Some("40"));
        assert_eq!(batch.ops[2].op, OpKind::Get);
    }

    #[test]
    fn batch_wire_round_trip() {
        let batch = Batch::new("dhcpd", LEVEL_INTERNAL)
            .set("@/clients/aa:bb:cc:dd:ee:ff/ipv4", "10.0.0.5", Some(123))
            .delete("@/clients/aa:bb:cc:dd:ee:ff/dhcp_name");
        let bytes = batch.to_bytes().unwrap();
        let back = Batch::from_bytes(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn reply_wire_round_trip() {
        let ok = Reply::ok("{\"value\":\"40\"}".into());
        let back = Reply::from_bytes(&ok.to_bytes().unwrap()).unwrap();
        assert!(back.is_ok());
        assert_eq!(back, ok);

        let fail = Reply::fail(ErrorKind::Exists, Some(1));
        let back = Reply::from_bytes(&fail.to_bytes().unwrap()).unwrap();
        assert!(!back.is_ok());
        assert_eq!(back.err, ErrorKind::Exists);
        assert_eq!(back.err_ordinal, Some(1));
    }

    #[test]
    fn op_kind_wire_names_are_screaming() {
        assert_eq!(serde_json::to_string(&OpKind::TestEq).unwrap(), "\"TESTEQ\"");
        assert_eq!(serde_json::to_string(&OpKind::Get).unwrap(), "\"GET\"");
        assert_eq!(serde_json::to_string(&OpKind::Ping).unwrap(), "\"PING\"");
    }

    #[test]
    fn mutating_ops_classified() {
        assert!(OpKind::Set.mutates());
        assert!(OpKind::Create.mutates());
        assert!(OpKind::Delete.mutates());
        assert!(!OpKind::Get.mutates());
        assert!(!OpKind::Test.mutates());
        assert!(!OpKind::TestEq.mutates());
        assert!(!OpKind::Ping.mutates());
    }

    #[test]
    fn decode_garbage_is_transport_error() {
        let err = Batch::from_bytes(&[0xFF, 0x00, 0x12]).unwrap_err();
        assert!(matches!(err, ConfigError::Transport { .. }));
    }
}
