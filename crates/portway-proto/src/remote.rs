//! Remote peer descriptor

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Descriptor of the remote peer behind one session, serialized inside
/// `RemoteConnected`/`RemoteDisconnect` payloads for client-side
/// observability callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConnection {
    pub peer_addr: SocketAddr,
}

impl RemoteConnection {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self { peer_addr }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RemoteConnection always serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_addr)
    }
}
