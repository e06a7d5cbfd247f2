//! The appliance-side local RPC endpoint.
//!
//! Co-located daemons connect to a fixed UNIX-domain socket and exchange
//! length-delimited MsgPack frames. Batch execution runs on the blocking
//! pool (the journal fsync must not stall the reactor); replies are
//! pushed with the configured send timeout so one wedged client cannot
//! pin a handler task. During shutdown every request -- new or already
//! read -- is refused with `SHUTTING_DOWN`.

use std::sync::Arc;

use cfgplane_core::{ConfigError, ErrorKind, Reply};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::LrpcConfig;
use crate::engine::ConfigEngine;
use crate::notify::NotificationBus;
use crate::rpc::{decode, encode, LrpcRequest, MonitorRequest};
use crate::shutdown::{RunState, ShutdownCoordinator};

/// The local RPC listener.
pub struct LrpcServer {
    engine: Arc<ConfigEngine>,
    bus: Arc<NotificationBus>,
    shutdown: Arc<ShutdownCoordinator>,
    config: LrpcConfig,
}

impl LrpcServer {
    #[must_use]
    pub fn new(
        engine: Arc<ConfigEngine>,
        bus: Arc<NotificationBus>,
        shutdown: Arc<ShutdownCoordinator>,
        config: LrpcConfig,
    ) -> Self {
        Self {
            engine,
            bus,
            shutdown,
            config,
        }
    }

    /// Timeouts, with any runtime `@/settings/cfgd/...` overrides applied.
    fn effective_config(&self) -> LrpcConfig {
        let mut config = self.config.clone();
        let override_ms = |name: &str| {
            self.engine
                .setting("cfgd", name)
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(std::time::Duration::from_millis)
        };
        if let Some(timeout) = override_ms("send_timeout") {
            config.send_timeout = timeout;
        }
        if let Some(timeout) = override_ms("recv_timeout") {
            config.recv_timeout = timeout;
        }
        if let Some(timeout) = override_ms("open_timeout") {
            config.open_timeout = timeout;
        }
        config
    }

    /// Accept loop. Keeps accepting during the drain phase (so late
    /// callers get a clean `SHUTTING_DOWN` refusal) and returns once the
    /// coordinator reaches `Stopped`.
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        let mut shutdown = self.shutdown.watch();
        tracing::info!("local RPC endpoint listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || matches!(*shutdown.borrow(), RunState::Stopped) {
                        tracing::info!("local RPC endpoint stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let config = self.effective_config();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        loop {
            let frame = match tokio::time::timeout(config.recv_timeout, framed.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => {
                    tracing::debug!(error = %err, "connection read error");
                    return;
                }
                // Peer closed, or idled past the receive window.
                Ok(None) | Err(_) => return,
            };

            let request = match decode::<LrpcRequest>(&frame) {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!(error = %err, "undecodable request frame");
                    let _ = Self::send_reply(
                        &mut framed,
                        &config,
                        &Reply::fail(ErrorKind::Transport, None),
                    )
                    .await;
                    return;
                }
            };

            match request {
                LrpcRequest::Exec(batch) => {
                    let reply = if self.shutdown.is_draining() {
                        Reply::fail(ErrorKind::ShuttingDown, None)
                    } else {
                        let _guard = self.shutdown.request_guard();
                        let engine = Arc::clone(&self.engine);
                        match tokio::task::spawn_blocking(move || engine.execute_to_reply(&batch))
                            .await
                        {
                            Ok(reply) => reply,
                            Err(err) => {
                                tracing::error!(error = %err, "batch task panicked");
                                Reply::fail(ErrorKind::Corrupt, None)
                            }
                        }
                    };
                    if Self::send_reply(&mut framed, &config, &reply).await.is_err() {
                        return;
                    }
                }
                LrpcRequest::Monitor(request) => {
                    // The connection is dedicated to the stream from here.
                    self.handle_monitor(framed, &config, &request).await;
                    return;
                }
            }
        }
    }

    async fn handle_monitor(
        &self,
        mut framed: Framed<UnixStream, LengthDelimitedCodec>,
        config: &LrpcConfig,
        request: &MonitorRequest,
    ) {
        if self.shutdown.is_draining() {
            let _ =
                Self::send_reply(&mut framed, config, &Reply::fail(ErrorKind::ShuttingDown, None))
                    .await;
            return;
        }
        let mut sub = match self.bus.subscribe(&request.pattern, request.kinds) {
            Ok(sub) => sub,
            Err(err) => {
                let _ = Self::send_reply(&mut framed, config, &Reply::fail(err.kind(), None)).await;
                return;
            }
        };
        if Self::send_reply(&mut framed, config, &Reply::ok(String::new()))
            .await
            .is_err()
        {
            return;
        }
        tracing::debug!(pattern = %request.pattern, "monitor stream open");

        let (mut sink, mut peer) = framed.split();
        let mut shutdown = self.shutdown.watch();
        loop {
            tokio::select! {
                notification = sub.recv() => {
                    let Some(notification) = notification else { return };
                    let Ok(bytes) = encode(&notification) else { return };
                    // Monitor pushes tolerate a slower consumer than the
                    // request/reply path does.
                    let pushed = tokio::time::timeout(
                        config.recv_timeout,
                        sink.send(bytes.into()),
                    )
                    .await;
                    if !matches!(pushed, Ok(Ok(()))) {
                        return;
                    }
                }
                frame = peer.next() => {
                    // Any close from the peer ends the stream.
                    if frame.is_none() {
                        return;
                    }
                }
                result = shutdown.changed() => {
                    // Draining lets the bus flush buffered events; the
                    // stream ends when the channel closes or at Stopped.
                    if result.is_err() || matches!(*shutdown.borrow(), RunState::Stopped) {
                        return;
                    }
                }
            }
        }
    }

    async fn send_reply(
        framed: &mut Framed<UnixStream, LengthDelimitedCodec>,
        config: &LrpcConfig,
        reply: &Reply,
    ) -> Result<(), ConfigError> {
        let bytes = reply.to_bytes()?;
        match tokio::time::timeout(config.send_timeout, framed.send(bytes.into())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConfigError::Transport {
                reason: format!("send: {err}"),
            }),
            Err(_) => Err(ConfigError::Timeout),
        }
    }
}
