//! Error types for syncpair operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::address::PeerAddress;
use crate::protocol::{Fault, FaultKind};
use crate::transport::TransportError;

/// Errors surfaced at the [`SyncNode`](crate::node::SyncNode) boundary.
///
/// The variants keep apart the situations a user fixes differently:
/// never paired, peer offline, peer declined, and peer moved to another port.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No sync folder has been selected yet.
    #[error("no sync folder has been selected")]
    NotConfigured,

    /// The tracked folder was renamed, moved, deleted or cannot be read.
    #[error("sync folder {} is unavailable: {source}", .path.display())]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A file inside the tracked folder could not be read while hashing.
    #[error("failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A sync was requested before any peer was paired.
    #[error("not paired with any peer")]
    NotPaired,

    /// Connection refused or host down while negotiating a pairing.
    #[error("peer {addr} is unreachable")]
    PeerUnreachable {
        addr: PeerAddress,
        previously_paired: bool,
        #[source]
        source: TransportError,
    },

    /// The peer answered the pairing request with "no".
    #[error("peer {0} declined the pairing request")]
    PeerDeclined(PeerAddress),

    /// The paired peer stopped answering during a sync (offline or new port).
    #[error("lost contact with peer {addr} during sync")]
    PeerLost {
        addr: PeerAddress,
        #[source]
        source: TransportError,
    },

    /// The endpoint port is already bound by another listener.
    #[error("address {0} is already in use")]
    AddressInUse(String),

    /// The requested file vanished before it could be transferred.
    #[error("file {0} is no longer available")]
    FileUnavailable(String),

    /// The persisted node record could not be decoded.
    #[error("persisted node state is corrupt: {0}")]
    StateCorrupt(String),

    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid port {0} (must be between 1024 and 65535)")]
    InvalidPort(String),

    #[error("invalid file name: {0:?}")]
    InvalidPath(String),

    /// Writing the node record failed. Losing the peer link or baseline
    /// would corrupt future syncs, so this one is fatal.
    #[error("failed to persist node state: {0}")]
    Persist(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(TransportError),
}

impl SyncError {
    /// Only a persistence failure should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Persist(_))
    }

    /// Wire form of this error for a remote caller.
    pub fn to_fault(&self) -> Fault {
        let kind = match self {
            SyncError::FileUnavailable(_) => FaultKind::FileUnavailable,
            SyncError::InvalidPath(_) => FaultKind::InvalidPath,
            SyncError::NotConfigured => FaultKind::NotConfigured,
            SyncError::DirectoryUnavailable { .. } => FaultKind::DirectoryUnavailable,
            SyncError::InvalidAddress(_) => FaultKind::InvalidAddress,
            _ => FaultKind::Internal,
        };
        Fault::new(kind, self.to_string())
    }
}

/// Result type for syncpair operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_directory_unavailable() {
        let err = SyncError::DirectoryUnavailable {
            path: PathBuf::from("/tmp/gone"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/gone"));
        assert!(msg.contains("unavailable"));
    }

    #[test]
    fn error_display_invalid_port() {
        let err = SyncError::InvalidPort("80".to_string());
        assert!(err.to_string().contains("invalid port 80"));
    }

    #[test]
    fn only_persist_is_fatal() {
        let persist = SyncError::Persist(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert!(persist.is_fatal());
        assert!(!SyncError::NotPaired.is_fatal());
        assert!(!SyncError::FileUnavailable("a.txt".into()).is_fatal());
        assert!(!SyncError::StateCorrupt("eof".into()).is_fatal());
    }

    #[test]
    fn fault_kinds_follow_variants() {
        assert_eq!(
            SyncError::FileUnavailable("a.txt".into()).to_fault().kind,
            FaultKind::FileUnavailable
        );
        assert_eq!(
            SyncError::InvalidPath("../x".into()).to_fault().kind,
            FaultKind::InvalidPath
        );
        assert_eq!(SyncError::NotConfigured.to_fault().kind, FaultKind::NotConfigured);
        assert_eq!(SyncError::NotPaired.to_fault().kind, FaultKind::Internal);
    }

    #[test]
    fn fault_keeps_message() {
        let fault = SyncError::FileUnavailable("gone.txt".into()).to_fault();
        assert!(fault.message.contains("gone.txt"));
    }
}
