//! On-disk pair history.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use pairsync_core::{PairHistory, PairRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StoreError;

/// `<config dir>/pairsync/pairs.json`, when the platform has a config dir.
pub fn default_store_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pairsync").join("pairs.json"))
}

/// Pair history with write-through persistence.
///
/// Records are never deleted automatically. A store without a path keeps
/// history in memory for the lifetime of the process.
#[derive(Debug)]
pub struct PairStore {
    path: Option<PathBuf>,
    history: PairHistory,
    /// Set once saves are handed to a background writer.
    writer: Option<mpsc::UnboundedSender<PairHistory>>,
}

impl PairStore {
    /// Load history from `path`. Missing or unreadable files start empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let history = load(&path);
        Self {
            path: Some(path),
            history,
            writer: None,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            history: PairHistory::default(),
            writer: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn history(&self) -> &PairHistory {
        &self.history
    }

    pub fn max_port(&self) -> Option<u16> {
        self.history.max_port()
    }

    /// Move disk writes off the caller onto a writer task using the
    /// blocking pool. Saves stay ordered; queued snapshots collapse into the
    /// latest. Must be called inside a tokio runtime.
    pub fn persist_in_background(&mut self) {
        if let (Some(path), None) = (&self.path, &self.writer) {
            self.writer = Some(spawn_writer(path.clone()));
        }
    }

    /// Record a successful session connect.
    pub fn record_connected(
        &mut self,
        local_path: &str,
        remote_path: &str,
        port: u16,
    ) -> Result<PairRecord, StoreError> {
        let record = self.history.upsert(local_path, remote_path, port);
        record.last_connected_at = Some(record.updated_at);
        let record = record.clone();
        self.save()?;
        Ok(record)
    }

    /// Record a switch hand-off on an existing pair.
    pub fn record_switch(
        &mut self,
        local_path: &str,
        remote_path: &str,
        port: u16,
    ) -> Result<PairRecord, StoreError> {
        let record = self.history.upsert(local_path, remote_path, port);
        record.last_switch_at = Some(record.updated_at);
        let record = record.clone();
        self.save()?;
        Ok(record)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.history.updated_at = Some(Utc::now());
        if let Some(writer) = &self.writer {
            if writer.send(self.history.clone()).is_ok() {
                return Ok(());
            }
            warn!("pair history writer stopped, saving inline");
        }
        save(path, &self.history)?;
        debug!(path = %path.display(), pairs = self.history.pairs.len(), "saved pair history");
        Ok(())
    }
}

fn load(path: &Path) -> PairHistory {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PairHistory::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read pair history, starting empty");
            return PairHistory::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(history) => history,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt pair history, starting empty");
            PairHistory::default()
        }
    }
}

fn spawn_writer(path: PathBuf) -> mpsc::UnboundedSender<PairHistory> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PairHistory>();
    tokio::spawn(async move {
        while let Some(mut history) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                history = newer;
            }
            let target = path.clone();
            let pairs = history.pairs.len();
            match tokio::task::spawn_blocking(move || save(&target, &history)).await {
                Ok(Ok(())) => debug!(path = %path.display(), pairs, "saved pair history"),
                Ok(Err(e)) => warn!(error = %e, "failed to save pair history"),
                Err(e) => warn!(error = %e, "pair history writer panicked"),
            }
        }
    });
    tx
}

fn save(path: &Path, history: &PairHistory) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(history)?).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
