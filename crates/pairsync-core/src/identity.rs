//! Participant identity.
//!
//! Every outbound state message carries the sender's identity. A receiver
//! drops anything tagged with its own identity; "remote" is simply any
//! identity different from the local one, so more than two participant kinds
//! can coexist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A participant tag such as `host`, `peer`, `vscode` or `jetbrains`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Default identity of the side that hosts discovery.
    pub fn host() -> Self {
        Self("host".to_string())
    }

    /// Default identity of the side that dials discovery.
    pub fn peer() -> Self {
        Self("peer".to_string())
    }

    /// The tag as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a message tagged `other` originated elsewhere.
    pub fn is_remote(&self, other: &Identity) -> bool {
        self != other
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentityParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdentityParseError::Whitespace(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity cannot be empty")]
    Empty,
    #[error("identity cannot contain whitespace, got: {0:?}")]
    Whitespace(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_tag() {
        let id: Identity = "jetbrains".parse().unwrap();
        assert_eq!(id.as_str(), "jetbrains");
        assert_eq!(id.to_string(), "jetbrains");
    }

    #[test]
    fn reject_empty_and_whitespace() {
        assert!(matches!(
            "".parse::<Identity>(),
            Err(IdentityParseError::Empty)
        ));
        assert!(matches!(
            "my editor".parse::<Identity>(),
            Err(IdentityParseError::Whitespace(_))
        ));
    }

    #[test]
    fn remote_is_anything_else() {
        let local = Identity::host();
        assert!(!local.is_remote(&Identity::host()));
        assert!(local.is_remote(&Identity::peer()));
        assert!(local.is_remote(&"vscode".parse().unwrap()));
    }

    #[test]
    fn serde_as_plain_string() {
        let json = serde_json::to_string(&Identity::peer()).unwrap();
        assert_eq!(json, "\"peer\"");
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Identity::peer());
        assert!(serde_json::from_str::<Identity>("\"\"").is_err());
    }
}
