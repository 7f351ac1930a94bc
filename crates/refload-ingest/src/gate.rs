//! Change detection for downloaded snapshots
//!
//! A snapshot is fingerprinted with SHA-256 and compared with the fingerprint of the last
//! successful run. [`has_changed`] is pure; the orchestrator decides when the new
//! fingerprint is written back into [`ImportState`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use refload_common::checksum::sha256_hex;
use refload_common::RefloadError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::catalog::RegisterKind;
use crate::error::Result;

/// Compare a payload against the previous fingerprint.
///
/// Returns whether it differs and the payload's own fingerprint.
pub fn has_changed(payload: &[u8], previous_hash: &str) -> (bool, String) {
    let new_hash = sha256_hex(payload);
    (new_hash != previous_hash, new_hash)
}

/// Change-detection state of one register
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportState {
    /// Fingerprint of the last successfully loaded snapshot, empty when none
    pub last_payload_hash: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ImportState {
    pub fn with_hash(hash: impl Into<String>) -> Self {
        Self {
            last_payload_hash: hash.into(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn record(&mut self, hash: impl Into<String>) {
        self.last_payload_hash = hash.into();
        self.updated_at = Some(Utc::now());
    }

    /// Forget the fingerprint so the next run compares from scratch
    pub fn reset(&mut self) {
        self.record(String::new());
    }
}

/// JSON file keeping [`ImportState`] across restarts
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all stored states. A missing file means no history.
    pub async fn load(&self) -> Result<HashMap<RegisterKind, ImportState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).map_err(RefloadError::from)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(RefloadError::from(e).into()),
        }
    }

    /// Store one register's state, leaving the others as they are
    pub async fn save(&self, register: RegisterKind, state: &ImportState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.load().await?;
        all.insert(register, state.clone());
        let json = serde_json::to_vec_pretty(&all).map_err(RefloadError::from)?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| RefloadError::Config(format!("state writer task failed: {}", e)))??;

        debug!(register = %register, path = %self.path.display(), "Import state saved");
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::result::Result<(), RefloadError> {
    use std::io::Write;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RefloadError::Io(e.error))?;
    Ok(())
}
