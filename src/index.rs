//! # Folder Index
//!
//! Tracks the top-level files of the sync folder by content hash and derives
//! what changed since the previous scan. Subdirectories are never descended
//! into; only plain files directly inside the folder are indexed.
//!
//! Content hashes (BLAKE3) rather than timestamps decide what changed, so
//! rewriting a file with identical bytes is not a change and clock skew
//! between the two machines does not matter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// 256-bit content digest of a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid hash {value:?}: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("invalid hash length in {value:?}"))?;
        Ok(Self(bytes))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

/// Absolute file path to content hash, as of the last scan.
pub type Snapshot = BTreeMap<PathBuf, ContentHash>;

/// File names that differ between two consecutive scans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Present in the previous snapshot, gone now.
    pub deletions: Vec<String>,
    /// New since the previous snapshot, or present with a different hash.
    pub changes: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletions.len() + self.changes.len()
    }
}

/// The tracked folder together with its snapshot.
///
/// Only `path` and `snapshot` are persisted; the change set and the list of
/// inbound writes are transient.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileIndex {
    path: Option<PathBuf>,
    #[serde(default)]
    snapshot: Snapshot,
    #[serde(skip)]
    pending: ChangeSet,
    #[serde(skip)]
    inbound: Vec<String>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Changes found by the most recent [`rescan`](Self::rescan).
    pub fn change_set(&self) -> &ChangeSet {
        &self.pending
    }

    /// Names written by an inbound sync that are not yet committed.
    pub fn pending_inbound(&self) -> &[String] {
        &self.inbound
    }

    /// Snapshot hash recorded for a top-level file name.
    pub fn hash_of(&self, name: &str) -> Option<ContentHash> {
        let dir = self.path.as_ref()?;
        self.snapshot.get(&dir.join(name)).copied()
    }

    /// Switch to a new folder, discarding the old baseline, and scan it.
    ///
    /// Every file in the new folder shows up in the resulting change set.
    /// Nothing is modified when the folder cannot be listed.
    pub fn set_directory(&mut self, path: impl Into<PathBuf>) -> Result<&ChangeSet> {
        let path = path.into();
        let fresh = scan_directory(&path)?;

        info!("Sync folder set to {}", path.display());
        self.pending = diff_snapshots(&path, &Snapshot::new(), &fresh);
        self.snapshot = fresh;
        self.path = Some(path);
        self.inbound.clear();
        Ok(&self.pending)
    }

    /// Rebuild the snapshot from disk and diff it against the previous one.
    pub fn rescan(&mut self) -> Result<&ChangeSet> {
        let dir = self.path.clone().ok_or(SyncError::NotConfigured)?;
        let fresh = scan_directory(&dir)?;

        self.pending = diff_snapshots(&dir, &self.snapshot, &fresh);
        self.snapshot = fresh;

        debug!(
            "Rescanned {}: {} deleted, {} changed",
            dir.display(),
            self.pending.deletions.len(),
            self.pending.changes.len()
        );
        Ok(&self.pending)
    }

    /// Remove files ahead of an inbound batch.
    ///
    /// Changed files go first since they are about to be recreated, then
    /// true deletions. Names already absent are skipped. Returns how many
    /// entries were actually removed from disk.
    pub fn apply_inbound_deletions(
        &mut self,
        deletions: &[String],
        changes: &[String],
    ) -> Result<usize> {
        let dir = self.path.clone().ok_or(SyncError::NotConfigured)?;
        for name in changes.iter().chain(deletions) {
            validate_file_name(name)?;
        }

        let mut removed = 0;
        for name in changes.iter().chain(deletions) {
            let target = dir.join(name);
            self.snapshot.remove(&target);

            let metadata = match fs::symlink_metadata(&target) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Cannot inspect {}: {}", target.display(), e);
                    continue;
                }
            };

            let result = if metadata.is_dir() {
                fs::remove_dir(&target)
            } else {
                fs::remove_file(&target)
            };

            match result {
                Ok(()) => {
                    debug!("Removed {}", target.display());
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", target.display(), e),
            }
        }

        Ok(removed)
    }

    /// Raw content of a tracked file.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        read_at(name, &self.path_of(name)?)
    }

    /// Materialize inbound content and remember it for [`commit_inbound`](Self::commit_inbound).
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        write_at(&self.path_of(name)?, data)?;
        self.record_inbound(name);
        Ok(())
    }

    /// Queue a file written through [`write_at`] for the next commit.
    pub fn record_inbound(&mut self, name: &str) {
        self.inbound.push(name.to_string());
    }

    /// Hash every file written since the last commit into the snapshot.
    ///
    /// Returns the committed names. A file that disappeared in the meantime
    /// is dropped from the snapshot instead.
    pub fn commit_inbound(&mut self) -> Result<Vec<String>> {
        let dir = self.path.clone().ok_or(SyncError::NotConfigured)?;
        let mut names = std::mem::take(&mut self.inbound);
        names.sort();
        names.dedup();

        let mut committed = Vec::with_capacity(names.len());
        for name in names {
            let target = dir.join(&name);
            match fs::read(&target) {
                Ok(data) => {
                    self.snapshot.insert(target, ContentHash::compute(&data));
                    committed.push(name);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Inbound file {} vanished before commit", name);
                    self.snapshot.remove(&target);
                }
                Err(e) => {
                    return Err(SyncError::Unreadable {
                        path: target,
                        source: e,
                    })
                }
            }
        }

        Ok(committed)
    }

    /// Location of `name` inside the tracked folder.
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        let dir = self.path.as_ref().ok_or(SyncError::NotConfigured)?;
        Ok(dir.join(name))
    }
}

/// Read a file resolved with [`FileIndex::path_of`]. A missing file is
/// `FileUnavailable`.
pub fn read_at(name: &str, target: &Path) -> Result<Vec<u8>> {
    match fs::read(target) {
        Ok(data) => Ok(data),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) || target.is_dir() => {
            Err(SyncError::FileUnavailable(name.to_string()))
        }
        Err(e) => Err(SyncError::Io(e)),
    }
}

pub fn write_at(target: &Path, data: &[u8]) -> Result<()> {
    fs::write(target, data)?;
    debug!("Wrote {} ({} bytes)", target.display(), data.len());
    Ok(())
}

/// A name from the wire must be a single path component inside the folder.
pub fn validate_file_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidPath(name.to_string()))
    }
}

fn scan_directory(dir: &Path) -> Result<Snapshot> {
    let unavailable = |source| SyncError::DirectoryUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    let mut snapshot = Snapshot::new();
    for entry in fs::read_dir(dir).map_err(unavailable)? {
        let entry = entry.map_err(unavailable)?;
        let path = entry.path();

        if entry.file_name().to_str().is_none() {
            warn!("Skipping non UTF-8 file name {}", path.display());
            continue;
        }

        // Follows symlinks so a link to a directory is skipped as well.
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SyncError::Unreadable { path, source: e }),
        };
        if metadata.is_dir() {
            continue;
        }

        match fs::read(&path) {
            Ok(data) => {
                snapshot.insert(path, ContentHash::compute(&data));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} vanished during scan", path.display());
            }
            Err(e) => return Err(SyncError::Unreadable { path, source: e }),
        }
    }

    Ok(snapshot)
}

fn diff_snapshots(root: &Path, old: &Snapshot, new: &Snapshot) -> ChangeSet {
    let relative = |path: &Path| -> String {
        path.strip_prefix(root)
            .ok()
            .or_else(|| path.file_name().map(Path::new))
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    };

    let deletions = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .map(|path| relative(path.as_path()))
        .collect();

    let changes = new
        .iter()
        .filter(|(path, hash)| old.get(*path) != Some(*hash))
        .map(|(path, _)| relative(path.as_path()))
        .collect();

    ChangeSet { deletions, changes }
}
