//! Active tunnel registry

use dashmap::DashMap;
use portway_proto::{ProtoMsg, TunnelId, TunnelRequest, TunnelType};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One live tunnel: its accepted request, the control-channel sender, and
/// the token that stops its public endpoint and sessions.
#[derive(Clone)]
pub struct TunnelEntry {
    tunnel_id: TunnelId,
    request: TunnelRequest,
    ctrl_tx: mpsc::UnboundedSender<ProtoMsg>,
    endpoint_cancel: CancellationToken,
}

impl TunnelEntry {
    pub(crate) fn new(
        tunnel_id: TunnelId,
        request: TunnelRequest,
        ctrl_tx: mpsc::UnboundedSender<ProtoMsg>,
        endpoint_cancel: CancellationToken,
    ) -> Self {
        Self {
            tunnel_id,
            request,
            ctrl_tx,
            endpoint_cancel,
        }
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn request(&self) -> &TunnelRequest {
        &self.request
    }
}

/// Registry of live tunnels on this server. Shared between the accept loop,
/// the per-tunnel handlers and administrative callers.
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, TunnelEntry>,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_tunnel_id(&self) -> TunnelId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, entry: TunnelEntry) {
        debug!("tunnel {} registered: {}", entry.tunnel_id, entry.request);
        self.tunnels.insert(entry.tunnel_id, entry);
    }

    pub(crate) fn unregister(&self, tunnel_id: TunnelId) {
        if self.tunnels.remove(&tunnel_id).is_some() {
            debug!("tunnel {} unregistered", tunnel_id);
        }
    }

    pub fn get(&self, tunnel_id: TunnelId) -> Option<TunnelEntry> {
        self.tunnels.get(&tunnel_id).map(|entry| entry.clone())
    }

    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        self.tunnels.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Tunnel currently holding a public TCP port.
    pub fn find_tcp_port(&self, port: u16) -> Option<TunnelId> {
        self.tunnels
            .iter()
            .find(|entry| {
                entry.request.tunnel_type == TunnelType::Tcp && entry.request.remote_port == port
            })
            .map(|entry| *entry.key())
    }

    /// HTTP/HTTPS tunnel registered for a virtual host. Consulted by the
    /// external routing layer.
    pub fn find_vhost(&self, host: &str) -> Option<TunnelEntry> {
        self.tunnels
            .iter()
            .find(|entry| {
                matches!(
                    entry.request.tunnel_type,
                    TunnelType::Http | TunnelType::Https
                ) && entry.request.vhost.as_deref() == Some(host)
            })
            .map(|entry| entry.clone())
    }

    /// Evict a tunnel: close its public endpoint now and ask the client to
    /// acknowledge and disconnect. Returns false for an unknown id.
    pub fn force_off(&self, tunnel_id: TunnelId) -> bool {
        match self.tunnels.get(&tunnel_id) {
            Some(entry) => {
                debug!("tunnel {} forced off", tunnel_id);
                let _ = entry.ctrl_tx.send(ProtoMsg::ForceOff);
                entry.endpoint_cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
