//! Observer interfaces for tunnel lifecycle

use portway_proto::{RemoteConnection, TunnelRequest};

/// Records why a control connection died: forced eviction vs protocol or
/// transport error, plus a human-readable cause. Set at most once before
/// close; cleared when a tunnel is established.
#[derive(Debug, Clone)]
pub struct InactiveReason {
    pub forced: bool,
    pub cause: String,
}

/// Control-connection lifecycle observer.
///
/// Methods default to no-ops and are invoked from the daemon's event loop,
/// so implementations must not block.
pub trait TunnelStateListener: Send + Sync {
    /// The server accepted the tunnel; `request` is the final (possibly
    /// rewritten) request.
    fn on_connected(&self, _request: &TunnelRequest) {}

    /// The control connection went inactive. `reason` is `None` for a plain
    /// network drop with no prior protocol event.
    fn on_inactive(&self, _request: Option<&TunnelRequest>, _reason: Option<&InactiveReason>) {}
}

/// Remote-connection lifecycle observer.
pub trait RemoteListener: Send + Sync {
    fn on_remote_connected(&self, _conn: &RemoteConnection) {}
    fn on_remote_disconnected(&self, _conn: &RemoteConnection) {}
}

/// Default "do nothing" observer.
#[derive(Debug, Default)]
pub struct NoopListener;

impl TunnelStateListener for NoopListener {}
impl RemoteListener for NoopListener {}
