use std::path::PathBuf;

use pairsync_core::ProtocolError;

pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Another process holds the discovery port. Not retried automatically.
    #[error("discovery port {port} is already in use; another instance is probably hosting")]
    DiscoveryBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("could not bind a session port after {attempts} attempts")]
    SessionBind {
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("no session ports left above {floor}")]
    PortsExhausted { floor: u16 },

    #[error("not connected to a peer")]
    NotConnected,

    #[error("no local selection has been published yet")]
    NoSelection,

    #[error("link is disabled")]
    Disabled,

    #[error("link supervisor has stopped")]
    Stopped,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("connection closed by remote")]
    PeerClosed,

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode pair history: {0}")]
    Encode(#[from] serde_json::Error),
}
