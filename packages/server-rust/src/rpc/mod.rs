//! Local RPC over a UNIX-domain socket.
//!
//! Frames are length-delimited MsgPack. An [`LrpcRequest::Exec`] carries
//! one wire batch and is answered by exactly one reply frame; an
//! [`LrpcRequest::Monitor`] is answered by an ack reply followed by a
//! stream of notification frames until the peer closes. One request is
//! outstanding per connection at a time.

pub mod client;
pub mod server;

use cfgplane_core::{Batch, ConfigError};
use serde::{Deserialize, Serialize};

use crate::notify::KindFilter;

pub use client::{ConfigClient, MonitorStream};
pub use server::LrpcServer;

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LrpcRequest {
    /// Execute one batch; answered by one `Reply` frame.
    Exec(Batch),
    /// Stream matching notifications; answered by an ack `Reply` frame
    /// followed by `Notification` frames.
    Monitor(MonitorRequest),
}

/// Parameters of a monitor stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Regular expression over paths.
    pub pattern: String,
    /// Event kinds to deliver.
    pub kinds: KindFilter,
}

pub(crate) fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ConfigError> {
    rmp_serde::to_vec_named(msg).map_err(|err| ConfigError::Transport {
        reason: format!("encode: {err}"),
    })
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ConfigError> {
    rmp_serde::from_slice(bytes).map_err(|err| ConfigError::Transport {
        reason: format!("decode: {err}"),
    })
}
