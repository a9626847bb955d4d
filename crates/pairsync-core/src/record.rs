//! Persisted pairing history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One previously established pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRecord {
    pub local_path: String,
    pub remote_path: String,
    pub port: u16,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PairRecord {
    pub fn new(local_path: impl Into<String>, remote_path: impl Into<String>, port: u16) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            port,
            last_connected_at: None,
            last_switch_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn matches(&self, local_path: &str, remote_path: &str) -> bool {
        self.local_path == local_path && self.remote_path == remote_path
    }
}

/// The whole on-disk document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairHistory {
    #[serde(default)]
    pub pairs: Vec<PairRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PairHistory {
    /// Highest session port ever recorded.
    pub fn max_port(&self) -> Option<u16> {
        self.pairs.iter().map(|p| p.port).max()
    }

    pub fn find(&self, local_path: &str, remote_path: &str) -> Option<&PairRecord> {
        self.pairs.iter().find(|p| p.matches(local_path, remote_path))
    }

    /// Insert or update the record for a pair and return it for further edits.
    pub fn upsert(&mut self, local_path: &str, remote_path: &str, port: u16) -> &mut PairRecord {
        let now = Utc::now();
        self.updated_at = Some(now);

        let index = match self.pairs.iter().position(|p| p.matches(local_path, remote_path)) {
            Some(index) => index,
            None => {
                self.pairs.push(PairRecord::new(local_path, remote_path, port));
                self.pairs.len() - 1
            }
        };
        let record = &mut self.pairs[index];
        record.port = port;
        record.updated_at = now;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_is_keyed_by_both_paths() {
        let mut history = PairHistory::default();
        history.upsert("/a", "/b", 3001);
        history.upsert("/a", "/c", 3002);
        history.upsert("/a", "/b", 3005);

        assert_eq!(history.pairs.len(), 2);
        assert_eq!(history.find("/a", "/b").unwrap().port, 3005);
        assert_eq!(history.max_port(), Some(3005));
        assert!(history.updated_at.is_some());
    }

    #[test]
    fn document_uses_camel_case() {
        let mut history = PairHistory::default();
        history.upsert("/a", "/b", 3001).last_connected_at = Some(Utc::now());
        let json = serde_json::to_value(&history).unwrap();

        let record = &json["pairs"][0];
        assert_eq!(record["localPath"], "/a");
        assert_eq!(record["remotePath"], "/b");
        assert_eq!(record["port"], 3001);
        assert!(record["lastConnectedAt"].is_string());
        assert!(record["lastSwitchAt"].is_null());
        assert!(json["updatedAt"].is_string());
    }

    #[test]
    fn empty_history_has_no_max_port() {
        assert_eq!(PairHistory::default().max_port(), None);
        let parsed: PairHistory = serde_json::from_str(r#"{"updatedAt":null}"#).unwrap();
        assert!(parsed.pairs.is_empty());
    }
}
