//! Local TCP tunnels over SSH
//!
//! A tunnel is a local listener whose inbound sockets are bridged to a
//! remote `host:port` through `direct-tcpip` channels on a pooled SSH
//! session. Handles close exactly once; closing the adapter closes every
//! live tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::client::Handle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::ClientHandler;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};

/// Requested tunnel shape.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Local port; 0 or unset picks an ephemeral port.
    pub local_port: u16,
    /// Local bind address, `127.0.0.1` by default.
    pub local_host: String,
    /// Remote host to forward to (as seen from the SSH server).
    pub remote_host: String,
    /// Remote port to forward to.
    pub remote_port: u16,
}

impl TunnelRequest {
    /// Forward an ephemeral local port to `remote_host:remote_port`.
    pub fn to(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port: 0,
            local_host: "127.0.0.1".to_string(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Pin the local port.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }
}

/// A live tunnel. Cloning shares the same underlying listener.
#[derive(Clone)]
pub struct TunnelHandle {
    /// Bound local port (never 0).
    pub local_port: u16,
    /// Local bind address.
    pub local_host: String,
    /// Remote forward target host.
    pub remote_host: String,
    /// Remote forward target port.
    pub remote_port: u16,
    pub(crate) id: u64,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
    events: EventBus,
}

impl TunnelHandle {
    /// Whether the tunnel still accepts connections.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Resolve once the tunnel has shut down, however that happened.
    pub(crate) async fn wait_closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stop the listener and every live bridged socket. Idempotent: the
    /// second and later calls are no-ops.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.events.publish_for(
            "ssh",
            EventPayload::SshTunnelClosed {
                local_port: self.local_port,
            },
        );
        debug!(local_port = self.local_port, "tunnel closed");
    }
}

/// Open the listener and start the accept loop. The loop exits when the
/// handle (or the adapter-wide `parent_shutdown`) is cancelled.
pub(crate) async fn open_tunnel(
    handle: Arc<Handle<ClientHandler>>,
    request: TunnelRequest,
    id: u64,
    parent_shutdown: &CancellationToken,
    events: EventBus,
) -> Result<TunnelHandle> {
    let listener = TcpListener::bind((request.local_host.as_str(), request.local_port))
        .await
        .map_err(|e| {
            Error::adapter(
                "ssh",
                format!(
                    "cannot bind tunnel listener on {}:{}: {}",
                    request.local_host, request.local_port, e
                ),
            )
        })?;
    let local_port = listener
        .local_addr()
        .map_err(|e| Error::adapter("ssh", format!("cannot read bound address: {}", e)))?
        .port();

    let shutdown = parent_shutdown.child_token();
    let tunnel = TunnelHandle {
        local_port,
        local_host: request.local_host.clone(),
        remote_host: request.remote_host.clone(),
        remote_port: request.remote_port,
        id,
        open: Arc::new(AtomicBool::new(true)),
        shutdown: shutdown.clone(),
        events: events.clone(),
    };

    events.publish_for(
        "ssh",
        EventPayload::SshTunnelCreated {
            local_port,
            remote_host: request.remote_host.clone(),
            remote_port: request.remote_port,
        },
    );

    let open_flag = Arc::clone(&tunnel.open);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "tunnel accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, local_port, "tunnel connection accepted");
                    let handle = Arc::clone(&handle);
                    let request = request.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge(handle, socket, peer, &request, shutdown).await {
                            warn!(error = %e, "tunnel bridge ended with error");
                        }
                    });
                }
            }
        }
        open_flag.store(false, Ordering::SeqCst);
        // Listener drops here; no new connections are accepted.
    });

    Ok(tunnel)
}

/// Bidirectionally copy between one accepted socket and a forwarded
/// channel, until either side closes or the tunnel shuts down.
async fn bridge(
    handle: Arc<Handle<ClientHandler>>,
    mut socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    request: &TunnelRequest,
    shutdown: CancellationToken,
) -> Result<()> {
    let channel = handle
        .channel_open_direct_tcpip(
            request.remote_host.as_str(),
            request.remote_port as u32,
            peer.ip().to_string().as_str(),
            peer.port() as u32,
        )
        .await?;
    let mut stream = channel.into_stream();

    tokio::select! {
        _ = shutdown.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            if let Ok((up, down)) = copied {
                debug!(up, down, "tunnel bridge finished");
            }
        }
    }
    Ok(())
}
