//! The live duplex channel to a paired process.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use pairsync_core::WireMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::supervisor::Input;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// A paired session socket split into a reader and a writer task.
///
/// Frames are forwarded to the supervisor tagged with this connection's id,
/// so anything still in flight from a replaced connection is recognisable as
/// stale. Dropping the handle stops the reader and lets the writer flush and
/// close the socket.
pub struct PairConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl PairConnection {
    pub(crate) fn spawn<S>(ws: WebSocketStream<S>, inputs: mpsc::UnboundedSender<Input>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::next();
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(?id, error = %e, "session write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let frame = Input::Frame {
                            conn: id,
                            text: text.to_string(),
                        };
                        if inputs.send(frame).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?id, ?frame, "session closed by remote");
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        debug!(?id, "ignoring binary frame");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(?id, error = %e, "session read failed");
                        break;
                    }
                }
            }
            let _ = inputs.send(Input::Closed { conn: id });
        });

        Self {
            id,
            outbound,
            reader,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue one frame. Fire and forget: ordering and delivery come from the
    /// underlying stream.
    pub fn send(&self, msg: &WireMessage) -> Result<()> {
        let text = msg.to_text()?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| LinkError::PeerClosed)
    }

    /// Close with an explicit code instead of a plain drop.
    pub fn close(self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }
}

impl Drop for PairConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Complete a server-side upgrade, refusing any request path but `path`.
pub(crate) async fn accept_tagged(
    stream: TcpStream,
    path: &'static str,
) -> Result<WebSocketStream<TcpStream>> {
    let check = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            return Ok(resp);
        }
        let mut err = ErrorResponse::new(Some(format!("this port only serves {path}")));
        *err.status_mut() = StatusCode::NOT_FOUND;
        Err(err)
    };
    Ok(tokio_tungstenite::accept_hdr_async(stream, check).await?)
}

/// Send a close frame and wait for the close handshake to finish.
pub(crate) async fn close_with<S>(ws: &mut WebSocketStream<S>, code: CloseCode, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "close handshake failed");
    }
}
