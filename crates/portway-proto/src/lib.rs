//! Portway Protocol Definitions
//!
//! This crate defines the tagged message protocol carried over a tunnel's
//! control connection, the tunnel request and remote-peer descriptor types
//! embedded in message payloads, and the length-delimited wire codec.

pub mod codec;
pub mod error;
pub mod message;
pub mod remote;
pub mod request;

pub use codec::ProtoCodec;
pub use error::ProtocolError;
pub use message::ProtoMsg;
pub use remote::RemoteConnection;
pub use request::{TunnelRequest, TunnelType};

/// Server-assigned identifier for one control-connection tunnel.
pub type TunnelId = u64;

/// Identifier for one remote-user connection multiplexed on a tunnel.
/// Unique within a `TunnelId`.
pub type SessionId = u64;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;
