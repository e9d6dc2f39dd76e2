//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use syncpair::{Frontend, NodeOptions, Startup, SyncNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Notify(String, String),
    Warn(String, String),
    Error(String, String),
}

impl Event {
    pub fn title(&self) -> &str {
        match self {
            Event::Notify(title, _) | Event::Warn(title, _) | Event::Error(title, _) => title,
        }
    }
}

/// Front end that records every message and answers pairing prompts with a
/// scripted value.
#[derive(Debug, Default)]
pub struct RecordingFrontend {
    accept: AtomicBool,
    prompts: AtomicUsize,
    events: Mutex<Vec<Event>>,
}

impl RecordingFrontend {
    pub fn accepting() -> Arc<Self> {
        let frontend = Self::default();
        frontend.accept.store(true, Ordering::SeqCst);
        Arc::new(frontend)
    }

    pub fn declining() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// How many pairing prompts were shown.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn saw(&self, title: &str) -> bool {
        self.events.lock().iter().any(|e| e.title() == title)
    }
}

#[async_trait]
impl Frontend for RecordingFrontend {
    fn notify(&self, title: &str, message: &str) {
        self.events
            .lock()
            .push(Event::Notify(title.to_string(), message.to_string()));
    }

    fn warn(&self, title: &str, message: &str) {
        self.events
            .lock()
            .push(Event::Warn(title.to_string(), message.to_string()));
    }

    fn report_error(&self, title: &str, message: &str) {
        self.events
            .lock()
            .push(Event::Error(title.to_string(), message.to_string()));
    }

    async fn confirm(&self, _title: &str, _message: &str) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.accept.load(Ordering::SeqCst)
    }
}

/// Loopback options for a node called `name` under `root`, on a free port.
pub fn node_options(root: &Path, name: &str) -> NodeOptions {
    NodeOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        state_path: root.join(name).join("state.json"),
    }
}

/// Create (if needed) and return the sync folder of node `name`.
pub fn folder_of(root: &Path, name: &str) -> PathBuf {
    let folder = root.join(name).join("folder");
    std::fs::create_dir_all(&folder).unwrap();
    folder
}

pub fn open_node(root: &Path, name: &str, frontend: Arc<RecordingFrontend>) -> (Arc<SyncNode>, Startup) {
    SyncNode::open(node_options(root, name), frontend)
}

/// Open and start a node without a sync folder.
pub async fn start_node(root: &Path, name: &str, frontend: Arc<RecordingFrontend>) -> Arc<SyncNode> {
    let (node, _) = open_node(root, name, frontend);
    node.start().await.unwrap();
    node
}

/// Open a node, point it at its folder and start it. Files present in the
/// folder beforehand become the node's pending changes.
pub async fn start_node_with_folder(
    root: &Path,
    name: &str,
    frontend: Arc<RecordingFrontend>,
) -> (Arc<SyncNode>, PathBuf) {
    let folder = folder_of(root, name);
    let (node, _) = open_node(root, name, frontend);
    node.set_directory(&folder).await.unwrap();
    node.start().await.unwrap();
    (node, folder)
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
