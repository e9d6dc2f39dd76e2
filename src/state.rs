//! # Persistent Node State
//!
//! The node record (peer link, tracked folder with its snapshot, port and
//! last sync time) lives in one JSON file. Saves replace the file
//! atomically by writing a sibling `.tmp` file, flushing it, and renaming it
//! over the target, so a crash mid-save leaves the previous record intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::address::PeerAddress;
use crate::index::FileIndex;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub peer: Option<PeerAddress>,
    pub folder: FileIndex,
    pub port: u16,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// Result of reading the record. Corruption is a value, never an error.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(PersistedRecord),
    NotFound,
    Corrupt(String),
}

#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> LoadOutcome {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return LoadOutcome::NotFound,
            Err(e) => return LoadOutcome::Corrupt(format!("cannot read {}: {}", self.path.display(), e)),
        };

        match serde_json::from_slice(&content) {
            Ok(record) => LoadOutcome::Loaded(record),
            Err(e) => LoadOutcome::Corrupt(format!("cannot decode {}: {}", self.path.display(), e)),
        }
    }

    pub fn save(&self, record: &PersistedRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!("Saved node state to {}", self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
