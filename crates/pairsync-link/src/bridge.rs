//! Capabilities the link needs from its host process.
//!
//! The editor integration and the window raising are supplied by whoever
//! embeds the link. [`EditorBridge`] is called from the supervisor task and
//! must return promptly. Focus strategies run on the blocking pool, so they
//! may shell out.

use std::path::Path;

use tracing::{debug, warn};

/// Opens files in the local editor.
pub trait EditorBridge: Send + Sync {
    /// Reveal `path` with the caret at `line`/`column`.
    fn open_file_at(&self, path: &Path, line: u32, column: u32) -> Result<(), BridgeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("cannot resolve {path}: {reason}")]
    Unresolved { path: String, reason: String },
    #[error("editor rejected the request: {0}")]
    Rejected(String),
}

/// Why a window is being raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusReason {
    /// The peer sent a focus frame.
    PeerRequested,
    /// The local user triggered a switch.
    LocalSwitch,
}

/// What a focus strategy may use to find the right window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusHint {
    pub reason: FocusReason,
    /// Workspace of the window to raise, if known.
    pub workspace: Option<String>,
}

/// One way of bringing a window to the front.
pub trait WindowFocuser: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `true` when the window was raised.
    fn try_focus(&self, hint: &FocusHint) -> bool;
}

/// Ordered fallback list of focus strategies. First success wins.
#[derive(Default)]
pub struct FocusChain {
    strategies: Vec<Box<dyn WindowFocuser>>,
}

impl FocusChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: impl WindowFocuser + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn push(&mut self, strategy: Box<dyn WindowFocuser>) {
        self.strategies.push(strategy);
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order. Failure is cosmetic and only logged.
    pub fn bring_to_front(&self, hint: &FocusHint) -> bool {
        for strategy in &self.strategies {
            if strategy.try_focus(hint) {
                debug!(strategy = strategy.name(), reason = ?hint.reason, "window raised");
                return true;
            }
            debug!(strategy = strategy.name(), "focus strategy failed");
        }
        if !self.strategies.is_empty() {
            warn!(?hint, "all focus strategies failed");
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        ok: bool,
        calls: Arc<AtomicUsize>,
    }

    impl WindowFocuser for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn try_focus(&self, _hint: &FocusHint) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ok
        }
    }

    fn hint() -> FocusHint {
        FocusHint {
            reason: FocusReason::LocalSwitch,
            workspace: Some("/proj".to_string()),
        }
    }

    #[test]
    fn first_success_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FocusChain::new()
            .with(Fixed { name: "a", ok: false, calls: calls.clone() })
            .with(Fixed { name: "b", ok: true, calls: calls.clone() })
            .with(Fixed { name: "c", ok: true, calls: calls.clone() });

        assert!(chain.bring_to_front(&hint()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn all_failing_is_not_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FocusChain::new()
            .with(Fixed { name: "a", ok: false, calls: calls.clone() })
            .with(Fixed { name: "b", ok: false, calls: calls.clone() });

        assert!(!chain.bring_to_front(&hint()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!FocusChain::new().bring_to_front(&hint()));
    }
}
