//! Discovery channel: the well-known port where a session port is negotiated.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pairsync_core::{DISCOVERY_PATH, HandshakeMessage, WireMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::connection::{accept_tagged, close_with};
use crate::error::{LinkError, Result};
use crate::supervisor::Input;

/// Host side: the bound well-known port.
///
/// The supervisor polls [`DiscoveryListener::accept`] itself, so dropping the
/// listener releases the port immediately.
pub(crate) struct DiscoveryListener {
    listener: TcpListener,
    port: u16,
}

impl DiscoveryListener {
    pub(crate) async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| LinkError::DiscoveryBind { port, source })?;
        info!(port, "discovery listener bound");
        Ok(Self { listener, port })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// Host side: service one discovery connection end to end.
///
/// `HandshakeDone` is reported as soon as the assignment is sent (or the
/// handshake fails) so the supervisor can accept the next dialer; the socket
/// then lingers for the grace period before closing.
pub(crate) async fn serve_handshake(
    stream: TcpStream,
    addr: SocketAddr,
    inputs: mpsc::UnboundedSender<Input>,
    epoch: u64,
    timings: Timings,
) {
    let result = handshake(stream, &inputs, epoch, timings).await;
    let _ = inputs.send(Input::HandshakeDone { epoch });
    match result {
        Ok(ws) => linger(ws, timings.discovery_grace).await,
        Err(e) => warn!(%addr, error = %e, "discovery handshake failed"),
    }
}

async fn handshake(
    stream: TcpStream,
    inputs: &mpsc::UnboundedSender<Input>,
    epoch: u64,
    timings: Timings,
) -> Result<WebSocketStream<TcpStream>> {
    // The upgrade and the hello share one window, so a client that connects
    // and stays silent is dropped just like one that never says hello.
    let deadline = Instant::now() + timings.hello_timeout;
    let mut ws = timeout_at(deadline, accept_tagged(stream, DISCOVERY_PATH))
        .await
        .map_err(|_| LinkError::Timeout("discovery upgrade"))??;

    let path = match timeout_at(deadline, read_hello(&mut ws)).await {
        Ok(Ok(path)) => path,
        Ok(Err(e)) => {
            close_with(&mut ws, CloseCode::Policy, "expected hello").await;
            return Err(e);
        }
        Err(_) => {
            close_with(&mut ws, CloseCode::Policy, "hello timeout").await;
            return Err(LinkError::Timeout("discovery hello"));
        }
    };
    debug!(workspace = %path, "discovery hello");

    let (reply, assigned) = oneshot::channel();
    inputs
        .send(Input::DiscoveryHello {
            epoch,
            path: path.clone(),
            reply,
        })
        .map_err(|_| LinkError::Stopped)?;

    match assigned.await.map_err(|_| LinkError::Stopped)? {
        Ok(port) => {
            let frame = WireMessage::port_assignment(port, path).to_text()?;
            ws.send(Message::Text(frame.into())).await?;
            Ok(ws)
        }
        Err(e) => {
            close_with(&mut ws, CloseCode::Error, "no session port available").await;
            Err(e)
        }
    }
}

async fn read_hello(ws: &mut WebSocketStream<TcpStream>) -> Result<String> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                return match WireMessage::parse(&text)? {
                    WireMessage::Handshake(HandshakeMessage::Hello { path }) => Ok(path),
                    other => Err(LinkError::UnexpectedFrame(format!("{other:?}"))),
                };
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                return Err(LinkError::UnexpectedFrame("binary".to_string()));
            }
            _ => {}
        }
    }
    Err(LinkError::PeerClosed)
}

async fn linger(mut ws: WebSocketStream<TcpStream>, grace: Duration) {
    let _ = timeout(grace, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    let _ = ws.close(None).await;
}

/// Where the host told us to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortAssignment {
    pub port: u16,
    pub workspace_path: String,
}

/// Peer side: announce our workspace and wait for a session port.
///
/// `Ok(None)` means the host closed (or went quiet) without assigning one;
/// `Err` means the host could not be reached at all.
pub(crate) async fn request_port(
    url: &str,
    workspace: &str,
    connect_timeout: Duration,
) -> Result<Option<PortAssignment>> {
    let (mut ws, _) = timeout(connect_timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| LinkError::Timeout("discovery connect"))??;

    let hello = WireMessage::hello(workspace).to_text()?;
    ws.send(Message::Text(hello.into())).await?;

    let assignment = timeout(connect_timeout, async {
        while let Some(msg) = ws.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            };
            match WireMessage::parse(&text) {
                Ok(WireMessage::Handshake(HandshakeMessage::PortAssignment {
                    port,
                    workspace_path,
                })) => {
                    return Some(PortAssignment {
                        port,
                        workspace_path,
                    });
                }
                Ok(other) => debug!(?other, "ignoring frame during discovery"),
                Err(e) => warn!(error = %e, "malformed frame during discovery"),
            }
        }
        None
    })
    .await
    .unwrap_or_else(|_| {
        debug!("no port assignment before timeout");
        None
    });

    let _ = ws.close(None).await;
    Ok(assignment)
}
