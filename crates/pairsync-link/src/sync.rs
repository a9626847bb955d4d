//! Translation between editor activity and state frames.

use std::path::Path;
use std::sync::Arc;

use pairsync_core::{EditorState, HandshakeMessage, Identity, ProtocolError, StateAction, WireMessage};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::{EditorBridge, FocusChain, FocusHint, FocusReason};
use crate::error::{LinkError, Result};
use crate::event::LinkEvent;

/// A local caret position reported by the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub is_active: bool,
}

impl Selection {
    pub fn new(path: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            path: path.into(),
            line,
            column,
            is_active: true,
        }
    }

    fn same_place(&self, state: &EditorState) -> bool {
        self.path == state.file_path && self.line == state.line && self.column == state.column
    }
}

/// What an inbound frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    PeerHello(String),
    Focus,
    /// Remote state opened in the editor.
    Applied(EditorState),
    /// Remote state whose file could not be opened.
    Unresolved(EditorState),
    /// Our own state reflected back.
    Echo,
    /// A discovery-only frame on the session channel.
    Ignored,
}

pub struct StateSync {
    identity: Identity,
    bridge: Arc<dyn EditorBridge>,
    focus: Arc<FocusChain>,
    events: broadcast::Sender<LinkEvent>,
    last_local: Option<Selection>,
    last_applied: Option<EditorState>,
}

impl StateSync {
    pub fn new(
        identity: Identity,
        bridge: Arc<dyn EditorBridge>,
        focus: Arc<FocusChain>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        Self {
            identity,
            bridge,
            focus,
            events,
            last_local: None,
            last_applied: None,
        }
    }

    /// Turn a local selection into an outbound state, unless it is the
    /// editor reacting to a state we just applied.
    pub fn outbound(&mut self, selection: Selection) -> Option<EditorState> {
        let echo = self
            .last_applied
            .take_if(|applied| selection.same_place(applied))
            .is_some();
        self.last_local = Some(selection.clone());
        if echo {
            debug!(path = %selection.path, "suppressing echo of applied state");
            return None;
        }
        Some(self.state_for(&selection, None))
    }

    /// Frames for a switch: the current state marked `switch`, then focus.
    pub fn switch_frames(&self) -> Result<[WireMessage; 2]> {
        let selection = self.last_local.as_ref().ok_or(LinkError::NoSelection)?;
        let mut state = self.state_for(selection, Some(StateAction::Switch));
        state.is_active = true;
        Ok([WireMessage::State(state), WireMessage::Focus])
    }

    /// Raise a window on the blocking pool. The outcome is only logged.
    pub fn raise(&self, reason: FocusReason, workspace: Option<String>) -> JoinHandle<bool> {
        let focus = self.focus.clone();
        let hint = FocusHint { reason, workspace };
        tokio::task::spawn_blocking(move || focus.bring_to_front(&hint))
    }

    /// Decode and act on one session frame.
    pub fn apply(&mut self, raw: &str, own_workspace: &str) -> Result<Inbound, ProtocolError> {
        match WireMessage::parse(raw)? {
            WireMessage::Handshake(HandshakeMessage::Hello { path }) => {
                let _ = self.events.send(LinkEvent::PeerHello { path: path.clone() });
                Ok(Inbound::PeerHello(path))
            }
            WireMessage::Handshake(HandshakeMessage::PortAssignment { port, .. }) => {
                debug!(port, "ignoring port assignment on session channel");
                Ok(Inbound::Ignored)
            }
            WireMessage::Focus => {
                let _ = self.events.send(LinkEvent::FocusRequested);
                self.raise(FocusReason::PeerRequested, Some(own_workspace.to_string()));
                Ok(Inbound::Focus)
            }
            WireMessage::State(state) => Ok(self.apply_state(state)),
        }
    }

    fn apply_state(&mut self, state: EditorState) -> Inbound {
        if !self.identity.is_remote(&state.source) {
            debug!(source = %state.source, "dropping state tagged with our own identity");
            return Inbound::Echo;
        }

        let _ = self.events.send(LinkEvent::IncomingState(state.clone()));
        match self
            .bridge
            .open_file_at(Path::new(&state.file_path), state.line, state.column)
        {
            Ok(()) => {
                self.last_applied = Some(state.clone());
                Inbound::Applied(state)
            }
            Err(e) => {
                warn!(path = %state.file_path, error = %e, "cannot open remote file");
                let _ = self.events.send(LinkEvent::Notice(format!(
                    "could not open {}: {e}",
                    state.file_path
                )));
                Inbound::Unresolved(state)
            }
        }
    }

    fn state_for(&self, selection: &Selection, action: Option<StateAction>) -> EditorState {
        EditorState {
            file_path: selection.path.clone(),
            line: selection.line,
            column: selection.column,
            source: self.identity.clone(),
            is_active: selection.is_active,
            action,
        }
    }
}
