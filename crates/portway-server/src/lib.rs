//! Portway tunnel server
//!
//! Accepts one control connection per tunnel, validates the tunnel request
//! (auth token, port policy), binds the public TCP endpoint, and fans
//! remote-user sessions out over the control connection as tagged protocol
//! messages. HTTP/HTTPS tunnels are validated and registered here; their
//! virtual-host routing lives in an external layer that consults the
//! registry.

mod handler;
pub mod interceptor;
pub mod port;
pub mod registry;
pub mod server;

pub use interceptor::{AllowAllInterceptor, DefaultInterceptor, TunnelRequestInterceptor};
pub use port::{InvalidPortRange, PortAllocator, PortRange};
pub use registry::{TunnelEntry, TunnelRegistry};
pub use server::{ServerConfig, ServerError, ServerHandle, TunnelServer};
