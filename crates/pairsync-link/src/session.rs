//! Session channel: the per-pair port carrying state and focus frames.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use pairsync_core::SESSION_PATH;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::allocator::PortAllocator;
use crate::connection::{PairConnection, accept_tagged, close_with};
use crate::error::{LinkError, Result};
use crate::supervisor::Input;

const MAX_BIND_ATTEMPTS: usize = 32;

/// A freshly opened session socket, before the supervisor decides to keep it.
pub(crate) enum SessionSocket {
    Accepted(WebSocketStream<TcpStream>),
    Dialed(WebSocketStream<MaybeTlsStream<TcpStream>>),
}

impl SessionSocket {
    pub(crate) fn into_connection(self, inputs: mpsc::UnboundedSender<Input>) -> PairConnection {
        match self {
            Self::Accepted(ws) => PairConnection::spawn(ws, inputs),
            Self::Dialed(ws) => PairConnection::spawn(ws, inputs),
        }
    }

    /// Refuse the socket with a policy-violation close.
    pub(crate) fn reject(self, reason: &'static str) {
        tokio::spawn(async move {
            match self {
                Self::Accepted(mut ws) => close_with(&mut ws, CloseCode::Policy, reason).await,
                Self::Dialed(mut ws) => close_with(&mut ws, CloseCode::Policy, reason).await,
            }
        });
    }
}

/// Bind the next free session port, skipping ports taken by other processes.
pub(crate) async fn bind_next(
    host: &str,
    allocator: &mut PortAllocator,
    in_use: &HashSet<u16>,
) -> Result<(u16, TcpListener)> {
    let mut last_err = None;
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = allocator.next(in_use)?;
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok((port, listener)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port, "session port busy, trying the next one");
                last_err = Some(e);
            }
            Err(source) => {
                return Err(LinkError::SessionBind {
                    attempts: 1,
                    source,
                });
            }
        }
    }
    Err(LinkError::SessionBind {
        attempts: MAX_BIND_ATTEMPTS,
        source: last_err.unwrap_or_else(|| std::io::ErrorKind::AddrInUse.into()),
    })
}

/// Host side: accept loop for one assigned port.
///
/// Every upgraded connection is handed to the supervisor, which keeps the
/// first one that matches a pending connection and rejects the rest. Each
/// upgrade runs in its own task bounded by `upgrade_timeout`, so a client
/// that never finishes the HTTP upgrade cannot hold up the next one.
pub(crate) struct SessionListener {
    task: JoinHandle<()>,
}

impl SessionListener {
    pub(crate) fn spawn(
        port: u16,
        listener: TcpListener,
        upgrade_timeout: Duration,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Self {
        info!(port, "session listener bound");
        let task = tokio::spawn(async move {
            // Dropped with this task, which aborts upgrades in flight.
            let mut upgrades = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!(port, error = %e, "session accept failed");
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                continue;
                            }
                        };
                        upgrades.spawn(upgrade(port, stream, addr, upgrade_timeout, inputs.clone()));
                    }
                    Some(_) = upgrades.join_next() => {}
                }
            }
        });
        Self { task }
    }
}

async fn upgrade(
    port: u16,
    stream: TcpStream,
    addr: SocketAddr,
    upgrade_timeout: Duration,
    inputs: mpsc::UnboundedSender<Input>,
) {
    match timeout(upgrade_timeout, accept_tagged(stream, SESSION_PATH)).await {
        Ok(Ok(ws)) => {
            let socket = SessionSocket::Accepted(ws);
            let _ = inputs.send(Input::SessionAccepted { port, socket });
        }
        Ok(Err(e)) => debug!(port, %addr, error = %e, "refused session upgrade"),
        Err(_) => debug!(port, %addr, "session upgrade timed out"),
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Peer side: dial the assigned session port.
pub(crate) async fn dial(url: &str, connect_timeout: Duration) -> Result<SessionSocket> {
    let (ws, _) = timeout(connect_timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| LinkError::Timeout("session connect"))??;
    Ok(SessionSocket::Dialed(ws))
}
