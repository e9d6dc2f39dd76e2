//! # RPC Wire Protocol
//!
//! Every remote call is one request frame followed by one response frame on
//! a fresh TCP connection. Frames are length-delimited (4-byte big-endian
//! length prefix) and carry JSON.
//!
//! ```text
//! request:  { "caller": "tcp://10.0.0.2:6666", "call": { "method": "sync", "deletions": [..], "changes": [..] } }
//! response: { "result": "synced", "report": { "deleted": 1, "received": ["b.txt"], "failed": [] } }
//! ```
//!
//! Three methods exist: `request` (pairing), `sync` (push a change set) and
//! `upload` (fetch one file). File content travels base64-encoded.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side accepts. Whole files travel in one frame.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Advertised address of the calling node.
    pub caller: String,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcCall {
    /// Ask the receiver to pair with the caller.
    Request,
    /// Apply the caller's change set, fetching changed files back from it.
    Sync {
        deletions: Vec<String>,
        changes: Vec<String>,
    },
    /// Return the raw bytes of one tracked file.
    Upload { path: String },
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::Request => "request",
            RpcCall::Sync { .. } => "sync",
            RpcCall::Upload { .. } => "upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RpcResponse {
    Pairing {
        accepted: bool,
    },
    Synced {
        report: SyncReport,
    },
    Content {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename = "fault")]
    Failed(Fault),
}

/// What the receiver did with one `sync` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub deleted: usize,
    pub received: Vec<String>,
    pub failed: Vec<FailedTransfer>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTransfer {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    FileUnavailable,
    InvalidPath,
    NotConfigured,
    DirectoryUnavailable,
    InvalidAddress,
    Internal,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::FileUnavailable => "file unavailable",
            FaultKind::InvalidPath => "invalid path",
            FaultKind::NotConfigured => "not configured",
            FaultKind::DirectoryUnavailable => "directory unavailable",
            FaultKind::InvalidAddress => "invalid address",
            FaultKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Error returned by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec decoding `D` and encoding `E`.
pub struct JsonCodec<D, E> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Codec for the listening side: reads requests, writes responses.
pub type ServerCodec = JsonCodec<RpcRequest, RpcResponse>;
/// Codec for the calling side: writes requests, reads responses.
pub type ClientCodec = JsonCodec<RpcResponse, RpcRequest>;

impl<D, E> JsonCodec<D, E> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
