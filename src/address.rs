//! # Peer Addresses
//!
//! Nodes identify each other by an address of the form `tcp://host:port`.
//! The scheme is optional on input, so `192.168.1.20:6666` and
//! `tcp://192.168.1.20:6666` name the same peer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::str::FromStr;

use crate::error::SyncError;

pub const SCHEME: &str = "tcp";

/// Network address of a node's RPC endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    /// `host:port` form accepted by socket APIs.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", SCHEME, self.authority())
    }
}

impl FromStr for PeerAddress {
    type Err = SyncError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidAddress(input.to_string());
        let trimmed = input.trim();

        let authority = match trimmed.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case(SCHEME) => rest,
            Some(_) => return Err(invalid()),
            None => trimmed,
        };

        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let host_ok = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
        if !host_ok {
            return Err(invalid());
        }

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.to_string()
    }
}

/// Best-effort guess of the LAN address other machines can reach us on.
///
/// Connecting a UDP socket sends no packets; it only asks the OS which
/// local interface would route toward a public address. Falls back to
/// loopback when the machine has no route.
pub fn detect_local_host() -> String {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
}
