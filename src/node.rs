//! # Sync Node
//!
//! A `SyncNode` owns the tracked folder index, the link to its single trusted
//! peer and the RPC endpoint the peer calls into. It implements both halves
//! of the protocol:
//!
//! - **Initiator**: [`connect`](SyncNode::connect) runs the pairing
//!   handshake and [`sync_now`](SyncNode::sync_now) pushes the changes found
//!   by the last [`scan`](SyncNode::scan) to the peer.
//! - **Receiver**: the [`RpcHandler`] impl answers pairing requests (asking
//!   the [`Frontend`] for consent), applies pushed change sets by fetching
//!   file content back from the caller, and serves `upload` calls.
//!
//! ## Locking
//!
//! Node fields sit behind one `parking_lot` mutex that is only held for
//! short sections and never across an `.await`. Index mutations (local
//! scans, folder selection and inbound batches) are additionally serialized
//! by the async `batch` lock. Outbound calls hold neither lock, so two nodes
//! pushing to each other at the same moment cannot deadlock.
//!
//! Every state change (pairing, port, folder, completed sync, shutdown) is
//! written to the [`StateStore`] on the blocking pool before the operation
//! returns. Saves are ordered by the async `saving` lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::address::PeerAddress;
use crate::error::{Result, SyncError};
use crate::frontend::Frontend;
use crate::index::{self, ChangeSet, ContentHash, FileIndex};
use crate::protocol::{FailedTransfer, Fault, FaultKind, SyncReport};
use crate::state::{LoadOutcome, PersistedRecord, StateStore};
use crate::transport::{PeerClient, RpcHandler, RpcServer, ServerHandle, TransportError};

/// Lowest port `set_port` accepts.
pub const MIN_PORT: u16 = 1024;

#[derive(Clone, Debug)]
pub struct NodeOptions {
    /// Host advertised to the peer and bound by the endpoint.
    pub host: String,
    /// Port used when no saved record exists. 0 picks a free port on start.
    pub port: u16,
    pub state_path: PathBuf,
}

/// How [`SyncNode::open`] found the saved record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Startup {
    Restored,
    Fresh,
    /// The record was unreadable and a fresh identity was created instead.
    Recovered(String),
}

#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub address: PeerAddress,
    pub running: bool,
    pub peer: Option<PeerAddress>,
    pub folder: Option<PathBuf>,
    pub tracked_files: usize,
    pub pending: ChangeSet,
    pub last_sync: Option<DateTime<Utc>>,
    pub state_file: PathBuf,
}

struct NodeState {
    identity: PeerAddress,
    peer: Option<PeerAddress>,
    index: FileIndex,
    last_sync: Option<DateTime<Utc>>,
    /// Changes waiting to be pushed. Survives a failed push and absorbs the
    /// results of later scans.
    outbox: ChangeSet,
    /// Bumped whenever the outbox is rebuilt.
    generation: u64,
}

impl NodeState {
    fn record(&self) -> PersistedRecord {
        PersistedRecord {
            peer: self.peer.clone(),
            folder: self.index.clone(),
            port: self.identity.port(),
            last_sync: self.last_sync,
        }
    }
}

pub struct SyncNode {
    state: Mutex<NodeState>,
    store: StateStore,
    saving: tokio::sync::Mutex<()>,
    frontend: Arc<dyn Frontend>,
    batch: tokio::sync::Mutex<()>,
    endpoint: tokio::sync::Mutex<Option<ServerHandle>>,
}

impl SyncNode {
    /// Load the saved record (if any) and build the node. Nothing is written
    /// and the endpoint is not started.
    pub fn open(options: NodeOptions, frontend: Arc<dyn Frontend>) -> (Arc<Self>, Startup) {
        let store = StateStore::new(&options.state_path);
        let fresh = |host: &str| NodeState {
            identity: PeerAddress::new(host, options.port),
            peer: None,
            index: FileIndex::new(),
            last_sync: None,
            outbox: ChangeSet::default(),
            generation: 0,
        };

        let (state, startup) = match store.load() {
            LoadOutcome::Loaded(record) => {
                info!(
                    "Restored node state from {} (peer: {})",
                    store.path().display(),
                    record
                        .peer
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "none".to_string())
                );
                let state = NodeState {
                    identity: PeerAddress::new(options.host.as_str(), record.port),
                    peer: record.peer,
                    index: record.folder,
                    last_sync: record.last_sync,
                    outbox: ChangeSet::default(),
                    generation: 0,
                };
                (state, Startup::Restored)
            }
            LoadOutcome::NotFound => (fresh(&options.host), Startup::Fresh),
            LoadOutcome::Corrupt(reason) => {
                let err = SyncError::StateCorrupt(reason.clone());
                frontend.report_error(
                    "Node data corrupt",
                    &format!("{err}. Starting with a fresh identity, please reconfigure."),
                );
                (fresh(&options.host), Startup::Recovered(reason))
            }
        };

        let node = Arc::new(Self {
            state: Mutex::new(state),
            store,
            saving: tokio::sync::Mutex::new(()),
            frontend,
            batch: tokio::sync::Mutex::new(()),
            endpoint: tokio::sync::Mutex::new(None),
        });
        (node, startup)
    }

    pub fn address(&self) -> PeerAddress {
        self.state.lock().identity.clone()
    }

    pub fn peer(&self) -> Option<PeerAddress> {
        self.state.lock().peer.clone()
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.state.lock().index.directory().map(|p| p.to_path_buf())
    }

    /// Changes found by the most recent scan or folder selection.
    pub fn change_set(&self) -> ChangeSet {
        self.state.lock().index.change_set().clone()
    }

    /// Changes the next [`sync_now`](Self::sync_now) will push: the latest
    /// scan plus anything an earlier push failed to deliver.
    pub fn pending(&self) -> ChangeSet {
        self.state.lock().outbox.clone()
    }

    pub fn hash_of(&self, name: &str) -> Option<ContentHash> {
        self.state.lock().index.hash_of(name)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_sync
    }

    pub fn state_file(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    /// Socket the endpoint is bound to, if running.
    pub async fn local_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.lock().await.as_ref().map(ServerHandle::local_addr)
    }

    pub async fn status(&self) -> NodeStatus {
        let running = self.endpoint.lock().await.is_some();
        let state = self.state.lock();
        NodeStatus {
            address: state.identity.clone(),
            running,
            peer: state.peer.clone(),
            folder: state.index.directory().map(|p| p.to_path_buf()),
            tracked_files: state.index.snapshot().len(),
            pending: state.outbox.clone(),
            last_sync: state.last_sync,
            state_file: self.store.path().to_path_buf(),
        }
    }

    /// Start serving RPC calls. Returns the advertised address.
    pub async fn start(self: &Arc<Self>) -> Result<PeerAddress> {
        let mut endpoint = self.endpoint.lock().await;
        self.start_endpoint(&mut endpoint)
            .await
            .inspect_err(|e| self.report(e))
    }

    /// Stop serving and wait for in-flight calls. Returns whether an
    /// endpoint was running.
    pub async fn stop(&self) -> bool {
        match self.endpoint.lock().await.take() {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Move the endpoint to another port, restarting it if it was running.
    ///
    /// The old listener is fully shut down before the new port is bound.
    pub async fn set_port(self: &Arc<Self>, port: u16) -> Result<()> {
        self.change_port(port)
            .await
            .inspect_err(|e| self.report(e))
    }

    async fn change_port(self: &Arc<Self>, port: u16) -> Result<()> {
        if port < MIN_PORT {
            return Err(SyncError::InvalidPort(port.to_string()));
        }

        let mut endpoint = self.endpoint.lock().await;
        let previous = self.address();
        let was_running = match endpoint.take() {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        };

        self.state.lock().identity = previous.with_port(port);
        if was_running {
            if let Err(e) = self.start_endpoint(&mut endpoint).await {
                // Keep serving where the peer already knows to find us.
                self.state.lock().identity = previous;
                if let Err(restart) = self.start_endpoint(&mut endpoint).await {
                    error!("Cannot resume listening on {}: {}", self.address(), restart);
                }
                return Err(e);
            }
        }
        self.persist().await?;
        info!("Port changed to {}", port);

        self.frontend
            .notify("Port changed", &format!("This node is now {}", self.address()));
        Ok(())
    }

    async fn start_endpoint(self: &Arc<Self>, slot: &mut Option<ServerHandle>) -> Result<PeerAddress> {
        if slot.is_some() {
            return Ok(self.address());
        }

        let bind = self.address();
        let handler: Arc<dyn RpcHandler> = Arc::clone(self) as Arc<dyn RpcHandler>;
        let handle = RpcServer::start(&bind, handler)
            .await
            .map_err(|e| match e {
                TransportError::AddressInUse(addr) => SyncError::AddressInUse(addr),
                other => SyncError::Transport(other),
            })?;

        if bind.port() == 0 {
            let bound = bind.with_port(handle.local_addr().port());
            self.state.lock().identity = bound;
        }
        *slot = Some(handle);

        let address = self.address();
        self.frontend
            .notify("Server running", &format!("Listening on {address}"));
        Ok(address)
    }

    /// Select the sync folder. Its whole content becomes the pending change
    /// set and the selection is saved.
    pub async fn set_directory(&self, path: impl Into<PathBuf>) -> Result<ChangeSet> {
        let result = self.select_folder(path.into()).await;
        match &result {
            Ok(changes) => self.frontend.notify(
                "Folder selected",
                &format!(
                    "Tracking {} ({} files)",
                    self.directory()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    changes.changes.len()
                ),
            ),
            Err(e) => self.report(e),
        }
        result
    }

    async fn select_folder(&self, path: PathBuf) -> Result<ChangeSet> {
        let _batch = self.batch.lock().await;
        let changes = self
            .with_index(move |index| index.set_directory(path).cloned())
            .await?;
        {
            let mut state = self.state.lock();
            state.outbox = changes.clone();
            state.generation += 1;
        }
        self.persist().await?;
        Ok(changes)
    }

    /// Rescan the sync folder and return what changed since the previous
    /// scan. Changes an earlier push failed to deliver stay in
    /// [`pending`](Self::pending) rather than in the result.
    pub async fn scan(&self) -> Result<ChangeSet> {
        self.rescan().await.inspect_err(|e| self.report(e))
    }

    async fn rescan(&self) -> Result<ChangeSet> {
        let _batch = self.batch.lock().await;
        let fresh = self.with_index(|index| index.rescan().cloned()).await?;

        let mut state = self.state.lock();
        let previous = std::mem::take(&mut state.outbox);
        let outbox = carry_over(previous, fresh.clone(), &state.index);
        state.outbox = outbox;
        state.generation += 1;
        Ok(fresh)
    }

    /// Pair with `target`, or reuse the pairing if it is already the peer.
    pub async fn connect(&self, target: &PeerAddress) -> Result<PeerClient> {
        self.negotiate(target)
            .await
            .inspect_err(|e| self.report(e))
    }

    async fn negotiate(&self, target: &PeerAddress) -> Result<PeerClient> {
        let (identity, current) = {
            let state = self.state.lock();
            (state.identity.clone(), state.peer.clone())
        };

        if *target == identity {
            return Err(SyncError::InvalidAddress(target.to_string()));
        }

        let client = PeerClient::new(target.clone(), identity);
        if current.as_ref() == Some(target) {
            debug!("Already paired with {}", target);
            return Ok(client);
        }

        info!("Requesting pairing with {}", target);
        let accepted = client.request().await.map_err(|source| match source {
            TransportError::Remote(_) => SyncError::Transport(source),
            source => SyncError::PeerUnreachable {
                addr: target.clone(),
                previously_paired: current.is_some(),
                source,
            },
        })?;

        if !accepted {
            return Err(SyncError::PeerDeclined(target.clone()));
        }

        self.set_peer(target.clone()).await?;
        info!("Paired with {}", target);
        self.frontend
            .notify("Paired", &format!("Now syncing with {target}"));
        Ok(client)
    }

    /// Push the pending change set to the peer.
    ///
    /// Returns `Ok(None)` when there is nothing to push.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        self.push().await.inspect_err(|e| self.report(e))
    }

    async fn push(&self) -> Result<Option<SyncReport>> {
        let (outbox, generation, peer) = {
            let state = self.state.lock();
            (state.outbox.clone(), state.generation, state.peer.clone())
        };

        if outbox.is_empty() {
            self.frontend
                .notify("Nothing to sync", "No changes since the last scan");
            return Ok(None);
        }
        let peer = peer.ok_or(SyncError::NotPaired)?;
        let client = self.negotiate(&peer).await?;

        info!(
            "Pushing {} deletions and {} changes to {}",
            outbox.deletions.len(),
            outbox.changes.len(),
            peer
        );
        let report = client
            .sync(&outbox.deletions, &outbox.changes)
            .await
            .map_err(|source| match source {
                TransportError::Remote(_) => SyncError::Transport(source),
                source => SyncError::PeerLost {
                    addr: peer.clone(),
                    source,
                },
            })?;

        {
            let mut state = self.state.lock();
            // A scan that ran during the push folded our entries into a new
            // outbox; leave it alone and let them go out again.
            if state.generation == generation {
                state.outbox = ChangeSet::default();
            }
            state.last_sync = Some(Utc::now());
        }
        self.persist().await?;

        let mut message = format!(
            "{} deleted, {} updated on {}",
            report.deleted,
            report.received.len(),
            peer
        );
        if !report.is_clean() {
            let skipped: Vec<&str> = report.failed.iter().map(|f| f.path.as_str()).collect();
            message.push_str(&format!("; skipped {}", skipped.join(", ")));
        }
        self.frontend.notify("Sync complete", &message);
        Ok(Some(report))
    }

    /// Stop the endpoint and save the record.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        self.persist().await.inspect_err(|e| self.report(e))?;
        info!("Node shut down");
        Ok(())
    }

    async fn set_peer(&self, peer: PeerAddress) -> Result<()> {
        let _saving = self.saving.lock().await;
        let (previous, record) = {
            let mut state = self.state.lock();
            let previous = state.peer.replace(peer);
            (previous, state.record())
        };

        if let Err(e) = self.save_record(record).await {
            self.state.lock().peer = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let _saving = self.saving.lock().await;
        let record = self.state.lock().record();
        self.save_record(record).await
    }

    /// Callers hold `saving`.
    async fn save_record(&self, record: PersistedRecord) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(io::Error::other)
            .and_then(|saved| saved)
            .map_err(|e| {
                error!("Failed to save node state to {}: {}", self.store.path().display(), e);
                SyncError::Persist(e)
            })
    }

    /// Run `f` against a copy of the index on the blocking pool and store
    /// the copy back. Callers hold the batch lock, which makes the write-back
    /// safe. Used once per scan or batch, never per file.
    async fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut FileIndex) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut index = self.state.lock().index.clone();
        let (index, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut index);
            (index, result)
        })
        .await
        .map_err(|e| SyncError::Io(io::Error::other(e)))?;

        self.state.lock().index = index;
        result
    }

    async fn receive(
        &self,
        caller: &PeerAddress,
        deletions: Vec<String>,
        changes: Vec<String>,
    ) -> Result<SyncReport> {
        let removals = (deletions, changes.clone());
        let deleted = self
            .with_index(move |index| index.apply_inbound_deletions(&removals.0, &removals.1))
            .await?;

        let client = PeerClient::new(caller.clone(), self.address());
        let mut report = SyncReport {
            deleted,
            ..Default::default()
        };
        let mut lost = None;

        for name in changes {
            let data = match client.upload(&name).await {
                Ok(data) => data,
                Err(TransportError::Remote(fault)) => {
                    if fault.kind == FaultKind::FileUnavailable {
                        self.report(&SyncError::FileUnavailable(name.clone()));
                    } else {
                        warn!("Peer refused {}: {}", name, fault);
                    }
                    report.failed.push(FailedTransfer {
                        path: name,
                        reason: fault.to_string(),
                    });
                    continue;
                }
                Err(source) => {
                    lost = Some(SyncError::PeerLost {
                        addr: caller.clone(),
                        source,
                    });
                    break;
                }
            };

            let target = self.state.lock().index.path_of(&name);
            let written = match target {
                Ok(target) => tokio::task::spawn_blocking(move || index::write_at(&target, &data))
                    .await
                    .map_err(|e| SyncError::Io(io::Error::other(e)))
                    .and_then(|written| written),
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => self.state.lock().index.record_inbound(&name),
                Err(e) => {
                    warn!("Failed to write {}: {}", name, e);
                    report.failed.push(FailedTransfer {
                        path: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Whatever arrived before a failure is still indexed.
        report.received = self.with_index(|index| index.commit_inbound()).await?;
        self.state.lock().last_sync = Some(Utc::now());
        self.persist().await?;

        if let Some(err) = lost {
            return Err(err);
        }

        info!(
            "Applied sync from {}: {} deleted, {} received, {} failed",
            caller,
            report.deleted,
            report.received.len(),
            report.failed.len()
        );
        self.frontend.notify(
            "Sync received",
            &format!(
                "{} deleted, {} updated from {}",
                report.deleted,
                report.received.len(),
                caller
            ),
        );
        Ok(report)
    }

    /// Turn an error into the matching front end message.
    fn report(&self, err: &SyncError) {
        let ui = &self.frontend;
        match err {
            SyncError::NotConfigured => ui.warn("No sync folder", "Select a folder to sync first."),
            SyncError::DirectoryUnavailable { path, .. } => ui.report_error(
                "Sync folder not found",
                &format!(
                    "{} was renamed, moved or deleted. Select the folder again.",
                    path.display()
                ),
            ),
            SyncError::Unreadable { .. } => ui.report_error("Scan failed", &err.to_string()),
            SyncError::NotPaired => ui.warn("Not paired", "Connect to a peer before syncing."),
            SyncError::PeerUnreachable {
                addr,
                previously_paired: false,
                ..
            } => ui.report_error(
                "Connection failed",
                &format!("Could not reach {addr}. Check the address and that the peer is running."),
            ),
            SyncError::PeerUnreachable { addr, .. } => ui.report_error(
                "Peer offline",
                &format!("Could not reach {addr}. The current pairing is unchanged."),
            ),
            SyncError::PeerDeclined(addr) => {
                ui.warn("Pairing declined", &format!("{addr} declined the pairing request."))
            }
            SyncError::PeerLost { addr, .. } => ui.report_error(
                "Sync failed",
                &format!(
                    "{addr} stopped responding. It may be offline or listening on another port; connect again once it is back."
                ),
            ),
            SyncError::AddressInUse(addr) => ui.report_error(
                "Port in use",
                &format!("{addr} is already taken. Choose another port."),
            ),
            SyncError::FileUnavailable(name) => ui.warn(
                "File skipped",
                &format!("{name} disappeared on the peer before it could be copied."),
            ),
            SyncError::StateCorrupt(_) => ui.report_error("Node data corrupt", &err.to_string()),
            SyncError::InvalidAddress(_) | SyncError::InvalidPort(_) | SyncError::InvalidPath(_) => {
                ui.warn("Invalid input", &err.to_string())
            }
            SyncError::Persist(_) => ui.report_error(
                "Cannot save node state",
                &format!("{err}. The node must stop to avoid losing its pairing or baseline."),
            ),
            SyncError::Io(_) | SyncError::Transport(_) => ui.report_error("Error", &err.to_string()),
        }
    }
}

/// Fold changes that were never delivered into a fresh scan result.
///
/// A leftover name still on disk is pushed as a change, anything else as a
/// deletion.
fn carry_over(previous: ChangeSet, fresh: ChangeSet, index: &FileIndex) -> ChangeSet {
    if previous.is_empty() {
        return fresh;
    }

    let mut changes: BTreeSet<String> = fresh.changes.into_iter().collect();
    let mut deletions: BTreeSet<String> = fresh.deletions.into_iter().collect();
    for name in previous.changes.into_iter().chain(previous.deletions) {
        if index.hash_of(&name).is_some() {
            deletions.remove(&name);
            changes.insert(name);
        } else {
            changes.remove(&name);
            deletions.insert(name);
        }
    }

    ChangeSet {
        deletions: deletions.into_iter().collect(),
        changes: changes.into_iter().collect(),
    }
}

#[async_trait]
impl RpcHandler for SyncNode {
    async fn request(&self, caller: PeerAddress) -> bool {
        let accepted = self
            .frontend
            .confirm(
                "Pairing request",
                &format!("{caller} wants to pair with this node. Accept?"),
            )
            .await;

        if !accepted {
            info!("Declined pairing with {}", caller);
            return false;
        }

        match self.set_peer(caller.clone()).await {
            Ok(()) => {
                info!("Paired with {}", caller);
                self.frontend
                    .notify("Paired", &format!("Now syncing with {caller}"));
                true
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    async fn sync(
        &self,
        caller: PeerAddress,
        deletions: Vec<String>,
        changes: Vec<String>,
    ) -> std::result::Result<SyncReport, Fault> {
        if deletions.is_empty() && changes.is_empty() {
            debug!("Empty sync from {}", caller);
            return Ok(SyncReport::default());
        }

        let _batch = self.batch.lock().await;
        self.receive(&caller, deletions, changes).await.map_err(|e| {
            self.report(&e);
            e.to_fault()
        })
    }

    async fn upload(&self, path: String) -> std::result::Result<Vec<u8>, Fault> {
        let target = self.state.lock().index.path_of(&path);
        let result = match target {
            Ok(target) => tokio::task::spawn_blocking(move || index::read_at(&path, &target))
                .await
                .map_err(|e| SyncError::Io(io::Error::other(e)))
                .and_then(|read| read),
            Err(e) => Err(e),
        };

        match result {
            Ok(data) => {
                debug!("Serving {} bytes", data.len());
                Ok(data)
            }
            Err(e) => {
                debug!("Upload refused: {}", e);
                Err(e.to_fault())
            }
        }
    }
}
