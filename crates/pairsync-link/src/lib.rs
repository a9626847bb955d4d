//! Pairing and focus handoff between two editor processes.
//!
//! A host binds the well-known discovery port and hands out one session port
//! per dialer; a peer dials discovery, receives its port and connects to it.
//! Once paired, both sides stream caret positions and can hand focus to each
//! other. Start a link with [`spawn`] and drive it through [`LinkHandle`].

mod allocator;
mod bridge;
mod config;
mod connection;
mod discovery;
mod error;
mod event;
mod session;
mod store;
mod supervisor;
mod sync;

pub use bridge::{BridgeError, EditorBridge, FocusChain, FocusHint, FocusReason, WindowFocuser};
pub use config::{LinkConfig, Role, Timings};
pub use error::{LinkError, Result, StoreError};
pub use event::{LinkEvent, LinkStatus};
pub use store::{PairStore, default_store_path};
pub use supervisor::{LinkHandle, spawn};
pub use sync::Selection;

pub use pairsync_core::{EditorState, Identity, LinkState, PairHistory, PairRecord};
