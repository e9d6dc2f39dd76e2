//! # syncpair
//!
//! Keeps one folder mirrored between two machines. Each node scans its
//! folder, works out what changed since the previous scan by content hash,
//! and pushes those changes to its single trusted peer over a small RPC
//! protocol.
//!
//! ## Features
//!
//! - **Pairing handshake**: a node syncs only with the one peer it paired with,
//!   and pairing needs the other side's consent
//! - **Hash-based change detection**: touch-without-modify and clock skew do
//!   not cause transfers
//! - **Push protocol**: the receiver deletes what the initiator deleted and
//!   fetches back every changed file
//! - **Durable state**: peer, folder baseline and port survive restarts
//!
//! ## Core Modules
//!
//! - [`index`] - Folder scanning and change detection
//! - [`state`] - Persisted node record
//! - [`protocol`] / [`transport`] - RPC wire format, endpoint and client
//! - [`node`] - Pairing and synchronization state machine
//! - [`frontend`] - Callbacks into the presentation layer
//! - [`cli`] / [`config`] - Command line front end and settings
//!
//! ## Quick Start
//!
//! ```bash
//! # On both machines
//! syncpair init
//! syncpair run --folder ~/Shared
//!
//! # In the console of one of them
//! connect 192.168.1.20:6666
//! sync
//! ```

pub mod address;
pub mod cli;
pub mod config;
pub mod error;
pub mod frontend;
pub mod index;
pub mod node;
pub mod protocol;
pub mod state;
pub mod transport;

pub use address::PeerAddress;
pub use config::Config;
pub use error::{Result, SyncError};
pub use frontend::{Frontend, LogFrontend, PairingPolicy};
pub use node::{NodeOptions, Startup, SyncNode};
