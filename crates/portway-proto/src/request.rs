//! Tunnel request type

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelType {
    Tcp,
    Http,
    Https,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Tcp => "tcp",
            TunnelType::Http => "http",
            TunnelType::Https => "https",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a tunnel to establish.
///
/// Created by the client before connecting, validated (and possibly
/// rewritten) exactly once by the server-side interceptor, then immutable
/// for the lifetime of the control connection. `remote_port == 0` asks the
/// server to auto-assign a port; the accepted request always carries a
/// concrete port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub tunnel_type: TunnelType,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub auth_token: Option<String>,
    /// Host-routing field for HTTP/HTTPS tunnels, consumed by an external
    /// virtual-host router.
    pub vhost: Option<String>,
}

impl TunnelRequest {
    /// TCP tunnel request. `remote_port == 0` requests auto-assignment.
    pub fn tcp(local_addr: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            tunnel_type: TunnelType::Tcp,
            local_addr: local_addr.into(),
            local_port,
            remote_port,
            auth_token: None,
            vhost: None,
        }
    }

    /// HTTP tunnel request routed by virtual host.
    pub fn http(local_addr: impl Into<String>, local_port: u16, vhost: impl Into<String>) -> Self {
        Self {
            tunnel_type: TunnelType::Http,
            local_addr: local_addr.into(),
            local_port,
            remote_port: 0,
            auth_token: None,
            vhost: Some(vhost.into()),
        }
    }

    /// HTTPS tunnel request routed by virtual host.
    pub fn https(local_addr: impl Into<String>, local_port: u16, vhost: impl Into<String>) -> Self {
        Self {
            tunnel_type: TunnelType::Https,
            local_addr: local_addr.into(),
            local_port,
            remote_port: 0,
            auth_token: None,
            vhost: Some(vhost.into()),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_remote_port(mut self, remote_port: u16) -> Self {
        self.remote_port = remote_port;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("TunnelRequest always serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tunnel_type {
            TunnelType::Tcp => write!(
                f,
                "tcp://{}:{}<-:{}",
                self.local_addr, self.local_port, self.remote_port
            ),
            TunnelType::Http | TunnelType::Https => write!(
                f,
                "{}://{}:{}<-{}",
                self.tunnel_type,
                self.local_addr,
                self.local_port,
                self.vhost.as_deref().unwrap_or("?")
            ),
        }
    }
}
