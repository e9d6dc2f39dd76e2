//! # RPC Transport
//!
//! A small request/response layer over TCP. Each call opens its own
//! connection, sends one [`RpcRequest`] and reads one [`RpcResponse`].
//!
//! The listening side runs an accept loop that hands every connection to a
//! task on a [`TaskTracker`]. Stopping the endpoint cancels the accept loop,
//! releases the port, and then waits for calls already being served to
//! finish, so a sync in progress is never cut off half-way.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::protocol::{
    ClientCodec, CodecError, Fault, RpcCall, RpcRequest, RpcResponse, ServerCodec, SyncReport,
};

/// Operations a node exposes to its peer.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Pairing request from `caller`. Returns whether it was accepted.
    async fn request(&self, caller: PeerAddress) -> bool;

    /// Apply a change set pushed by `caller`.
    async fn sync(
        &self,
        caller: PeerAddress,
        deletions: Vec<String>,
        changes: Vec<String>,
    ) -> Result<SyncReport, Fault>;

    /// Raw bytes of one file in the tracked folder.
    async fn upload(&self, path: String) -> Result<Vec<u8>, Fault>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address {0} is already in use")]
    AddressInUse(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot reach {addr}: {source}")]
    Unreachable {
        addr: PeerAddress,
        #[source]
        source: io::Error,
    },

    #[error("{0} closed the connection without answering")]
    Disconnected(PeerAddress),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("remote error: {0}")]
    Remote(Fault),

    #[error("unexpected response to {call}")]
    UnexpectedResponse { call: &'static str },
}

pub struct RpcServer;

impl RpcServer {
    /// Bind `addr` and start serving `handler` in the background.
    ///
    /// Port 0 binds an ephemeral port; read it back from
    /// [`ServerHandle::local_addr`].
    pub async fn start(
        addr: &PeerAddress,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<ServerHandle, TransportError> {
        let listener = TcpListener::bind((addr.host(), addr.port()))
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::AddrInUse => TransportError::AddressInUse(addr.authority()),
                _ => TransportError::Bind {
                    addr: addr.authority(),
                    source,
                },
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.authority(),
            source,
        })?;

        info!("RPC endpoint listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown.clone(),
            tracker.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            tracker,
            accept_task,
        })
    }
}

/// A running endpoint. Dropping it without [`stop`](Self::stop) leaves the
/// listener running.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, release the port, then wait for in-flight calls.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.accept_task.await {
            warn!("RPC accept loop on {} ended abnormally: {}", self.local_addr, e);
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("RPC endpoint on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!("Accepted RPC connection from {}", remote);
                tracker.spawn(serve_connection(
                    stream,
                    Arc::clone(&handler),
                    shutdown.clone(),
                ));
            }
            Err(e) => warn!("Failed to accept RPC connection: {}", e),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, ServerCodec::new());

    // Only the wait for a request is cancellable; once it has arrived the
    // call runs to completion.
    let request = tokio::select! {
        _ = shutdown.cancelled() => return,
        frame = framed.next() => frame,
    };

    let request = match request {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            warn!("Dropping malformed RPC request: {}", e);
            return;
        }
        None => return,
    };

    let method = request.call.method();
    debug!("Serving {} from {}", method, request.caller);

    let response = dispatch(handler.as_ref(), request).await;
    if let Err(e) = framed.send(response).await {
        warn!("Failed to answer {} call: {}", method, e);
    }
}

async fn dispatch(handler: &dyn RpcHandler, request: RpcRequest) -> RpcResponse {
    let RpcRequest { caller, call } = request;

    match call {
        RpcCall::Request => match caller.parse::<PeerAddress>() {
            Ok(caller) => RpcResponse::Pairing {
                accepted: handler.request(caller).await,
            },
            Err(e) => RpcResponse::Failed(e.to_fault()),
        },
        RpcCall::Sync { deletions, changes } => match caller.parse::<PeerAddress>() {
            Ok(caller) => match handler.sync(caller, deletions, changes).await {
                Ok(report) => RpcResponse::Synced { report },
                Err(fault) => RpcResponse::Failed(fault),
            },
            Err(e) => RpcResponse::Failed(e.to_fault()),
        },
        RpcCall::Upload { path } => match handler.upload(path).await {
            Ok(data) => RpcResponse::Content { data },
            Err(fault) => RpcResponse::Failed(fault),
        },
    }
}

/// Caller side of the protocol, bound to one target node.
#[derive(Debug, Clone)]
pub struct PeerClient {
    target: PeerAddress,
    caller: PeerAddress,
}

impl PeerClient {
    /// `caller` is the address the target should use to call back.
    pub fn new(target: PeerAddress, caller: PeerAddress) -> Self {
        Self { target, caller }
    }

    pub fn target(&self) -> &PeerAddress {
        &self.target
    }

    /// Ask the target to pair with us.
    pub async fn request(&self) -> Result<bool, TransportError> {
        match self.call(RpcCall::Request).await? {
            RpcResponse::Pairing { accepted } => Ok(accepted),
            _ => Err(TransportError::UnexpectedResponse { call: "request" }),
        }
    }

    /// Push a change set. Returns once the target has fetched every changed
    /// file.
    pub async fn sync(
        &self,
        deletions: &[String],
        changes: &[String],
    ) -> Result<SyncReport, TransportError> {
        let call = RpcCall::Sync {
            deletions: deletions.to_vec(),
            changes: changes.to_vec(),
        };
        match self.call(call).await? {
            RpcResponse::Synced { report } => Ok(report),
            _ => Err(TransportError::UnexpectedResponse { call: "sync" }),
        }
    }

    /// Fetch one file's bytes from the target.
    pub async fn upload(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let call = RpcCall::Upload {
            path: path.to_string(),
        };
        match self.call(call).await? {
            RpcResponse::Content { data } => Ok(data),
            _ => Err(TransportError::UnexpectedResponse { call: "upload" }),
        }
    }

    async fn call(&self, call: RpcCall) -> Result<RpcResponse, TransportError> {
        let stream = TcpStream::connect((self.target.host(), self.target.port()))
            .await
            .map_err(|source| TransportError::Unreachable {
                addr: self.target.clone(),
                source,
            })?;

        let mut framed = Framed::new(stream, ClientCodec::new());
        framed
            .send(RpcRequest {
                caller: self.caller.to_string(),
                call,
            })
            .await?;

        match framed.next().await {
            Some(Ok(RpcResponse::Failed(fault))) => Err(TransportError::Remote(fault)),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Disconnected(self.target.clone())),
        }
    }
}
