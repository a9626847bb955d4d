//! Link configuration.

use pairsync_core::{DEFAULT_DISCOVERY_PORT, Identity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which end of the rendezvous this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Binds the discovery port and hands out session ports.
    Host,
    /// Dials the discovery port and connects to the assigned session port.
    Peer,
}

impl Role {
    pub fn default_identity(self) -> Identity {
        match self {
            Self::Host => Identity::host(),
            Self::Peer => Identity::peer(),
        }
    }
}

/// Protocol timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub hello_timeout: Duration,
    pub discovery_grace: Duration,
    pub pending_ttl: Duration,
    pub reconnect_delay: Duration,
    pub discovery_retry: Duration,
    pub error_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(5),
            discovery_grace: Duration::from_secs(5),
            pending_ttl: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            discovery_retry: Duration::from_secs(3),
            error_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: Role,
    pub identity: Identity,
    /// Workspace announced in hello frames and recorded in pair history.
    pub workspace: String,
    pub bind_host: String,
    pub discovery_port: u16,
    pub auto_reconnect: bool,
    pub timings: Timings,
}

impl LinkConfig {
    pub fn new(role: Role, workspace: impl Into<String>) -> Self {
        Self {
            role,
            identity: role.default_identity(),
            workspace: workspace.into(),
            bind_host: "127.0.0.1".to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            auto_reconnect: true,
            timings: Timings::default(),
        }
    }

    /// Lowest session port the allocator may hand out.
    pub fn session_port_floor(&self) -> u16 {
        self.discovery_port.saturating_add(1)
    }

    pub(crate) fn ws_url(&self, port: u16, path: &str) -> String {
        format!("ws://{}:{}{}", self.bind_host, port, path)
    }
}
