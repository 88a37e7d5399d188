//! Tunnel server

use crate::handler::{handle_control, ServerCtx};
use crate::interceptor::{DefaultInterceptor, TunnelRequestInterceptor};
use crate::port::{PortAllocator, PortRange};
use crate::registry::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("invalid port allow-list: {0}")]
    AllowList(#[from] crate::port::InvalidPortRange),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control-connection bind address.
    pub bind_addr: String,
    /// Optional exact-match auth token; `None` disables enforcement.
    pub auth_token: Option<String>,
    /// Port allow-list expression; `None` or empty means the full
    /// ephemeral range.
    pub allow_ports: Option<String>,
    /// Control connections silent for longer than this are closed.
    pub read_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5080".to_string(),
            auth_token: None,
            allow_ports: None,
            read_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_allow_ports(mut self, expr: impl Into<String>) -> Self {
        self.allow_ports = Some(expr.into());
        self
    }

    pub fn with_read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_idle_timeout = timeout;
        self
    }
}

/// Reverse tunnel server: accepts control connections, validates tunnel
/// requests and fans remote-user sessions out to the owning client.
pub struct TunnelServer {
    config: ServerConfig,
    interceptor: Option<Arc<dyn TunnelRequestInterceptor>>,
    tls: Option<TlsAcceptor>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            interceptor: None,
            tls: None,
        }
    }

    /// Replace the default auth/port-policy interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn TunnelRequestInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Serve the control port over TLS. The acceptor is treated as an
    /// opaque context.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Bind the control listener and start accepting tunnels.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let TunnelServer {
            config,
            interceptor,
            tls,
        } = self;

        let allow = match config.allow_ports.as_deref() {
            Some(expr) if !expr.trim().is_empty() => Some(PortRange::parse(expr)?),
            _ => None,
        };
        let allocator = Arc::new(PortAllocator::new(allow.clone().unwrap_or_default()));
        let registry = Arc::new(TunnelRegistry::new());
        let interceptor = interceptor.unwrap_or_else(|| {
            Arc::new(DefaultInterceptor::new(
                config.auth_token.clone(),
                allow,
                allocator.clone(),
            ))
        });

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|err| ServerError::Bind {
                addr: config.bind_addr.clone(),
                reason: err.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!("tunnel server listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let ctx = Arc::new(ServerCtx {
            interceptor,
            allocator,
            registry: registry.clone(),
            read_idle_timeout: config.read_idle_timeout,
            shutdown: shutdown.clone(),
        });

        let accept_cancel = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer_addr)) => {
                            debug!("control connection from {}", peer_addr);
                            let ctx = ctx.clone();
                            match tls.clone() {
                                Some(acceptor) => {
                                    tokio::spawn(async move {
                                        match acceptor.accept(socket).await {
                                            Ok(stream) => handle_control(stream, peer_addr, ctx).await,
                                            Err(err) => {
                                                debug!("TLS handshake with {} failed: {}", peer_addr, err);
                                            }
                                        }
                                    });
                                }
                                None => {
                                    tokio::spawn(handle_control(socket, peer_addr, ctx));
                                }
                            }
                        }
                        Err(err) => {
                            error!("accept failed: {}", err);
                        }
                    }
                }
            }
        });

        Ok(ServerHandle {
            local_addr,
            registry,
            shutdown,
            task,
        })
    }
}

/// Handle to a running tunnel server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Stop accepting and tear down every live tunnel.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}
