//! Protocol messages.
//!
//! Every frame is one UTF-8 JSON object. Handshake frames carry a `type`
//! field; state and focus frames do not, so inbound text goes through
//! [`WireMessage::parse`] rather than a single derived enum.

use crate::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discovery and session handshake frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandshakeMessage {
    /// Announces a workspace. Sent by the dialing side on discovery and by
    /// the listening side once a session is accepted.
    Hello { path: String },
    /// Discovery reply telling the dialer which session port to use.
    PortAssignment {
        port: u16,
        #[serde(rename = "workspacePath")]
        workspace_path: String,
    },
}

/// Marker for an explicit hand-off of focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Switch,
}

/// Current file and caret of one editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorState {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub source: Identity,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StateAction>,
}

impl EditorState {
    pub fn is_switch(&self) -> bool {
        self.action == Some(StateAction::Switch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FocusAction {
    Focus,
}

#[derive(Serialize, Deserialize)]
struct FocusFrame {
    action: FocusAction,
}

/// Any frame that can travel over a discovery or session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Handshake(HandshakeMessage),
    State(EditorState),
    /// Asks the receiver to raise its window. No payload.
    Focus,
}

impl WireMessage {
    pub fn hello(path: impl Into<String>) -> Self {
        Self::Handshake(HandshakeMessage::Hello { path: path.into() })
    }

    pub fn port_assignment(port: u16, workspace_path: impl Into<String>) -> Self {
        Self::Handshake(HandshakeMessage::PortAssignment {
            port,
            workspace_path: workspace_path.into(),
        })
    }

    /// Classify and decode one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Json)?;
        let Value::Object(ref fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if let Some(kind) = fields.get("type") {
            let kind = kind.as_str().unwrap_or_default().to_string();
            return serde_json::from_value(value)
                .map(Self::Handshake)
                .map_err(|source| ProtocolError::Malformed { kind, source });
        }

        if fields.contains_key("filePath") {
            return serde_json::from_value(value)
                .map(Self::State)
                .map_err(|source| ProtocolError::Malformed {
                    kind: "state".to_string(),
                    source,
                });
        }

        match fields.get("action").and_then(Value::as_str) {
            Some("focus") => Ok(Self::Focus),
            Some(other) => Err(ProtocolError::UnknownAction(other.to_string())),
            None => Err(ProtocolError::Unrecognized),
        }
    }

    /// Encode as a single text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let text = match self {
            Self::Handshake(msg) => serde_json::to_string(msg),
            Self::State(state) => serde_json::to_string(state),
            Self::Focus => serde_json::to_string(&FocusFrame {
                action: FocusAction::Focus,
            }),
        };
        text.map_err(ProtocolError::Json)
    }
}

/// A frame that could not be understood. Never fatal to a connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("malformed {kind:?} frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("unrecognized frame shape")]
    Unrecognized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hello_and_assignment() {
        assert_eq!(
            WireMessage::parse(r#"{"type":"hello","path":"/proj"}"#).unwrap(),
            WireMessage::hello("/proj")
        );
        assert_eq!(
            WireMessage::parse(r#"{"type":"port-assignment","port":3001,"workspacePath":"/proj"}"#)
                .unwrap(),
            WireMessage::port_assignment(3001, "/proj")
        );
    }

    #[test]
    fn parse_state_without_optional_fields() {
        let msg =
            WireMessage::parse(r#"{"filePath":"/a.py","line":10,"column":4,"source":"peer"}"#)
                .unwrap();
        let WireMessage::State(state) = msg else {
            panic!("expected state, got {msg:?}");
        };
        assert_eq!(state.file_path, "/a.py");
        assert_eq!((state.line, state.column), (10, 4));
        assert_eq!(state.source, Identity::peer());
        assert!(!state.is_active);
        assert!(!state.is_switch());
    }

    #[test]
    fn parse_switch_state() {
        let msg = WireMessage::parse(
            r#"{"filePath":"/b.rs","line":0,"column":0,"source":"host","isActive":true,"action":"switch"}"#,
        )
        .unwrap();
        assert!(matches!(msg, WireMessage::State(ref s) if s.is_switch() && s.is_active));
    }

    #[test]
    fn parse_focus() {
        assert_eq!(
            WireMessage::parse(r#"{"action":"focus"}"#).unwrap(),
            WireMessage::Focus
        );
    }

    #[test]
    fn encode_matches_wire_format() {
        assert_eq!(
            WireMessage::port_assignment(3001, "/proj").to_text().unwrap(),
            r#"{"type":"port-assignment","port":3001,"workspacePath":"/proj"}"#
        );
        assert_eq!(
            WireMessage::Focus.to_text().unwrap(),
            r#"{"action":"focus"}"#
        );

        let state = EditorState {
            file_path: "/a.py".to_string(),
            line: 1,
            column: 2,
            source: Identity::host(),
            is_active: true,
            action: None,
        };
        assert_eq!(
            WireMessage::State(state).to_text().unwrap(),
            r#"{"filePath":"/a.py","line":1,"column":2,"source":"host","isActive":true}"#
        );
    }

    #[test]
    fn reject_bad_frames() {
        assert!(matches!(
            WireMessage::parse("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            WireMessage::parse("[1,2]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            WireMessage::parse(r#"{"type":"goodbye"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            WireMessage::parse(r#"{"filePath":"/a","line":-1,"column":0,"source":"peer"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            WireMessage::parse(r#"{"action":"dance"}"#),
            Err(ProtocolError::UnknownAction(_))
        ));
        assert!(matches!(
            WireMessage::parse(r#"{"hello":"world"}"#),
            Err(ProtocolError::Unrecognized)
        ));
    }
}
