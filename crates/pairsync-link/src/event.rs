//! Notifications and status published by a running link.

use pairsync_core::{EditorState, LinkState};

/// Snapshot of the supervisor, readable without touching the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub auto_reconnect: bool,
    /// A reconnect or retry timer is running.
    pub reconnecting: bool,
    /// Session port of the live or pending pair.
    pub assigned_port: Option<u16>,
    /// Workspace last announced by the peer.
    pub peer_path: Option<String>,
}

impl LinkStatus {
    pub(crate) fn disabled(auto_reconnect: bool) -> Self {
        Self {
            state: LinkState::Disabled,
            auto_reconnect,
            reconnecting: false,
            assigned_port: None,
            peer_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A remote editor state arrived.
    IncomingState(EditorState),
    /// The peer asked this side to raise its window.
    FocusRequested,
    /// The peer announced its workspace.
    PeerHello { path: String },
    Status(LinkStatus),
    /// Something the user should see: bind conflicts, unresolved files.
    Notice(String),
}
