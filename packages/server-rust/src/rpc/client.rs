//! Client side of the local RPC endpoint.
//!
//! Used by co-located daemons and by `cfgctl`. Each request opens the
//! socket (one outstanding request per connection), pushes one frame,
//! and waits for the reply. Transport failures -- connect, send, or a
//! lost reply -- are retried with exponential backoff before the caller
//! sees a `TRANSPORT` error; logical failures come back in the reply and
//! are never retried.

use std::path::PathBuf;
use std::time::Duration;

use cfgplane_core::{Batch, ConfigError, Reply};
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::LrpcConfig;
use crate::notify::{KindFilter, Notification};
use crate::rpc::{decode, encode, LrpcRequest, MonitorRequest};

/// Retries after the first transport failure.
const TRANSPORT_RETRIES: u32 = 3;

/// Backoff before the first retry; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to the appliance's configuration endpoint.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    socket: PathBuf,
    config: LrpcConfig,
}

impl ConfigClient {
    /// A client for the endpoint at `socket` with default timeouts.
    #[must_use]
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            config: LrpcConfig::default(),
        }
    }

    /// Overrides the transport timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, config: LrpcConfig) -> Self {
        self.config = config;
        self
    }

    async fn connect(&self) -> Result<Framed<UnixStream, LengthDelimitedCodec>, ConfigError> {
        let connected =
            tokio::time::timeout(self.config.open_timeout, UnixStream::connect(&self.socket))
                .await;
        match connected {
            Ok(Ok(stream)) => Ok(Framed::new(stream, LengthDelimitedCodec::new())),
            Ok(Err(err)) => Err(ConfigError::Transport {
                reason: format!("connect {}: {err}", self.socket.display()),
            }),
            Err(_) => Err(ConfigError::Transport {
                reason: format!("connect {}: open timeout", self.socket.display()),
            }),
        }
    }

    async fn round_trip(&self, request: &LrpcRequest) -> Result<Reply, ConfigError> {
        let mut framed = self.connect().await?;
        let bytes = encode(request)?;
        framed
            .send(bytes.into())
            .await
            .map_err(|err| ConfigError::Transport {
                reason: format!("send: {err}"),
            })?;

        match tokio::time::timeout(self.config.recv_timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => Reply::from_bytes(&frame),
            Ok(Some(Err(err))) => Err(ConfigError::Transport {
                reason: format!("recv: {err}"),
            }),
            Ok(None) => Err(ConfigError::Transport {
                reason: "connection closed before reply".to_string(),
            }),
            Err(_) => Err(ConfigError::Transport {
                reason: "receive timeout".to_string(),
            }),
        }
    }

    /// Executes one batch, retrying transport failures.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` once retries are exhausted. Logical failures are not
    /// errors at this layer: they come back inside the [`Reply`].
    pub async fn exec(&self, batch: &Batch) -> Result<Reply, ConfigError> {
        let request = LrpcRequest::Exec(batch.clone());
        let mut backoff = RETRY_BACKOFF;
        let mut last = None;

        for attempt in 0..=TRANSPORT_RETRIES {
            match self.round_trip(&request).await {
                Ok(reply) => return Ok(reply),
                Err(err @ ConfigError::Transport { .. }) => {
                    tracing::debug!(attempt, error = %err, "transport failure; backing off");
                    last = Some(err);
                    if attempt < TRANSPORT_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or(ConfigError::Timeout))
    }

    /// Convenience: executes a batch and surfaces a failure reply as the
    /// matching [`ConfigError`].
    ///
    /// # Errors
    ///
    /// Transport failures as in [`ConfigClient::exec`]; logical failures
    /// reconstructed from the reply's wire code.
    pub async fn exec_checked(&self, batch: &Batch) -> Result<Reply, ConfigError> {
        let reply = self.exec(batch).await?;
        match reply.err.to_error() {
            None => Ok(reply),
            Some(err) => Err(err),
        }
    }

    /// Opens a monitor stream for paths matching `pattern`.
    ///
    /// # Errors
    ///
    /// `TRANSPORT` when the endpoint is unreachable; the server's
    /// refusal (bad pattern, shutdown) reconstructed from the ack reply.
    pub async fn monitor(
        &self,
        pattern: &str,
        kinds: KindFilter,
    ) -> Result<MonitorStream, ConfigError> {
        let mut framed = self.connect().await?;
        let bytes = encode(&LrpcRequest::Monitor(MonitorRequest {
            pattern: pattern.to_string(),
            kinds,
        }))?;
        framed
            .send(bytes.into())
            .await
            .map_err(|err| ConfigError::Transport {
                reason: format!("send: {err}"),
            })?;

        let ack = match tokio::time::timeout(self.config.recv_timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => Reply::from_bytes(&frame)?,
            Ok(Some(Err(err))) => {
                return Err(ConfigError::Transport {
                    reason: format!("recv: {err}"),
                })
            }
            Ok(None) => {
                return Err(ConfigError::Transport {
                    reason: "connection closed before monitor ack".to_string(),
                })
            }
            Err(_) => return Err(ConfigError::Timeout),
        };
        if let Some(err) = ack.err.to_error() {
            return Err(err);
        }
        Ok(MonitorStream { framed })
    }
}

/// A live monitor stream.
#[derive(Debug)]
pub struct MonitorStream {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl MonitorStream {
    /// Next notification; `None` when the server closed the stream.
    /// Blocks indefinitely -- monitoring has no receive deadline.
    pub async fn next(&mut self) -> Option<Result<Notification, ConfigError>> {
        match self.framed.next().await? {
            Ok(frame) => Some(decode(&frame)),
            Err(err) => Some(Err(ConfigError::Transport {
                reason: format!("recv: {err}"),
            })),
        }
    }
}
