//! Core types for pairsync.
//!
//! This crate provides the wire format and the persisted data model shared by
//! both sides of a pair. It performs no I/O.

mod identity;
mod message;
mod record;

pub use identity::{Identity, IdentityParseError};
pub use message::{EditorState, HandshakeMessage, ProtocolError, StateAction, WireMessage};
pub use record::{PairHistory, PairRecord};

use serde::{Deserialize, Serialize};

/// Well-known discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 3000;

/// Request path of discovery connections.
pub const DISCOVERY_PATH: &str = "/discovery";

/// Request path of session (data) connections.
pub const SESSION_PATH: &str = "/session";

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    /// Not participating. Initial state.
    Disabled,
    /// Hosting or dialing the discovery port.
    Discovering,
    /// Port assigned, dialing the session port.
    AwaitingSessionConnect,
    /// Session channel live.
    Connected,
    /// Discovery failed, waiting before the next attempt.
    ErrorBackoff,
}

impl LinkState {
    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}
