//! Image ingress: a TCP listener turning length-prefixed frames into
//! `image_received` events.
//!
//! One task accepts, one task serves each connection. Both are cancelled on
//! exit, and exit waits for every connection task to finish.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::frame::{read_frame, FrameError};
use crate::config::ServerConfig;
use crate::events::{Event, EventBus};
use crate::lifecycle::Component;

pub struct ImageServer {
    bus: EventBus,
    bind_addr: String,
    max_frame_bytes: usize,
    local_addr: Option<SocketAddr>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
}

impl ImageServer {
    pub fn new(bus: EventBus, config: &ServerConfig) -> Self {
        Self {
            bus,
            bind_addr: config.bind_addr(),
            max_frame_bytes: config.max_frame_bytes,
            local_addr: None,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            acceptor: None,
        }
    }

    /// Bound address while entered; resolves port `0` to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl Component for ImageServer {
    fn name(&self) -> &str {
        "image_server"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("failed to bind image server on {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.cancel = CancellationToken::new();
        self.tracker = TaskTracker::new();
        self.acceptor = Some(tokio::spawn(accept_loop(
            listener,
            self.bus.clone(),
            self.max_frame_bytes,
            self.tracker.clone(),
            self.cancel.clone(),
        )));
        info!(addr = %local_addr, "image server listening");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let joined = match self.acceptor.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        self.tracker.close();
        self.tracker.wait().await;
        self.local_addr = None;
        info!("image server stopped");
        joined?;
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    bus: EventBus,
    max_frame_bytes: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(serve_connection(
                        stream,
                        peer,
                        bus.clone(),
                        max_frame_bytes,
                        cancel.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    bus: EventBus,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    info!(peer = %peer, "client connected");
    let from = peer.to_string();
    let mut frames = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = read_frame(&mut stream, max_frame_bytes) => read,
        };
        match read {
            Ok(Some(bytes)) => {
                frames += 1;
                debug!(peer = %peer, len = bytes.len(), "frame received");
                if let Err(e) = bus.publish(Event::ImageReceived {
                    bytes,
                    from: from.clone(),
                }) {
                    warn!(peer = %peer, error = %e, "failed to publish frame");
                }
            }
            Ok(None) => break,
            Err(e) if e.is_protocol_violation() => {
                warn!(peer = %peer, error = %e, "protocol violation; closing connection");
                break;
            }
            Err(FrameError::Truncated { .. }) => {
                debug!(peer = %peer, "client disconnected mid-frame");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "client error");
                break;
            }
        }
    }
    info!(peer = %peer, frames, "client disconnected");
}
