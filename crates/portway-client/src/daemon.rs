//! Client tunnel daemon
//!
//! One daemon per control connection: sends the tunnel request, then
//! consumes protocol messages and drives establishment, payload relay,
//! remote disconnects and forced eviction. Outbound messages flow through a
//! writer task that flushes each message and performs flush-then-close on
//! teardown, so buffered frames are delivered before the socket drops.

use crate::listener::{InactiveReason, NoopListener, RemoteListener, TunnelStateListener};
use crate::pool::{ControlSender, LocalPool};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use portway_proto::{ProtoCodec, ProtoMsg, RemoteConnection, SessionId, TunnelId, TunnelRequest};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Client daemon errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server control address, `host:port`.
    pub server_addr: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Tunnel client: connects to a portway server and spawns one daemon per
/// control connection.
pub struct TunnelClient {
    config: ClientConfig,
    state_listener: Arc<dyn TunnelStateListener>,
    remote_listener: Arc<dyn RemoteListener>,
    tls: Option<(TlsConnector, String)>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state_listener: Arc::new(NoopListener),
            remote_listener: Arc::new(NoopListener),
            tls: None,
        }
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn TunnelStateListener>) -> Self {
        self.state_listener = listener;
        self
    }

    pub fn with_remote_listener(mut self, listener: Arc<dyn RemoteListener>) -> Self {
        self.remote_listener = listener;
        self
    }

    /// Use TLS for the control connection. The connector is treated as an
    /// opaque context.
    pub fn with_tls(mut self, connector: TlsConnector, server_name: impl Into<String>) -> Self {
        self.tls = Some((connector, server_name.into()));
        self
    }

    /// Open the control connection and send the tunnel request. Lifecycle
    /// from here on is reported through the configured listeners.
    pub async fn connect(&self, request: TunnelRequest) -> Result<TunnelHandle, ClientError> {
        let addr = self.config.server_addr.clone();
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr.clone()))?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        debug!("connected to server {}", addr);

        match &self.tls {
            Some((connector, server_name)) => {
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|_| ClientError::InvalidServerName(server_name.clone()))?;
                let stream = connector.connect(name, stream).await?;
                Ok(self.spawn_daemon(Framed::new(stream, ProtoCodec::new()), request))
            }
            None => Ok(self.spawn_daemon(Framed::new(stream, ProtoCodec::new()), request)),
        }
    }

    fn spawn_daemon<S>(&self, framed: Framed<S, ProtoCodec>, request: TunnelRequest) -> TunnelHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();

        let (sink, stream) = framed.split();
        let writer = tokio::spawn(write_control(sink, out_rx, close_rx));

        let daemon = Daemon {
            pool: LocalPool::new(),
            out_tx,
            state_listener: self.state_listener.clone(),
            remote_listener: self.remote_listener.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        };
        tokio::spawn(async move {
            daemon.run(stream, request, shutdown_rx, close_tx, writer).await;
            let _ = done_tx.send(());
        });

        TunnelHandle {
            shutdown: shutdown_tx,
            done: done_rx,
        }
    }
}

/// Handle to a running tunnel daemon.
pub struct TunnelHandle {
    shutdown: mpsc::Sender<()>,
    done: oneshot::Receiver<()>,
}

impl TunnelHandle {
    /// Ask the daemon to flush and close the control connection.
    pub async fn close(&self) {
        let _ = self.shutdown.send(()).await;
    }

    /// Wait until the control connection is fully torn down.
    pub async fn closed(self) {
        let _ = self.done.await;
    }
}

/// Per-control-connection state owned by the daemon for the connection's
/// lifetime.
#[derive(Default)]
struct ConnState {
    tunnel_id: Option<TunnelId>,
    session_id: Option<SessionId>,
    request: Option<TunnelRequest>,
    inactive: Option<InactiveReason>,
    /// Last tunnel id observed on this connection. Survives the clearing
    /// done by ResponseErr/ForceOff so teardown can still find pool entries.
    seen_tunnel: Option<TunnelId>,
}

enum Flow {
    Continue,
    Close,
}

struct Daemon {
    pool: LocalPool,
    out_tx: ControlSender,
    state_listener: Arc<dyn TunnelStateListener>,
    remote_listener: Arc<dyn RemoteListener>,
    heartbeat_interval: Duration,
}

impl Daemon {
    async fn run<S>(
        self,
        mut stream: SplitStream<Framed<S, ProtoCodec>>,
        request: TunnelRequest,
        mut shutdown_rx: mpsc::Receiver<()>,
        close_tx: oneshot::Sender<()>,
        writer: JoinHandle<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = ConnState::default();
        let _ = self.out_tx.send(ProtoMsg::request(&request));
        debug!("tunnel request sent: {}", request);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(msg)) => {
                        if let Flow::Close = self.handle_message(msg, &mut state) {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("control connection error: {}", err);
                        break;
                    }
                    None => {
                        debug!("control connection closed by server");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    let _ = self.out_tx.send(ProtoMsg::Ping);
                }
                _ = shutdown_rx.recv() => {
                    debug!("close requested");
                    break;
                }
            }
        }

        // flush whatever the handlers queued, then close the transport
        let _ = close_tx.send(());
        let _ = writer.await;

        if let (Some(tunnel_id), Some(session_id)) = (state.tunnel_id, state.session_id) {
            if let Some(conn) = self.pool.remove(&(tunnel_id, session_id)) {
                conn.close_graceful();
            }
        }
        if let Some(tunnel_id) = state.seen_tunnel {
            for conn in self.pool.remove_all(tunnel_id) {
                conn.abort();
            }
        }
        self.state_listener
            .on_inactive(state.request.as_ref(), state.inactive.as_ref());
    }

    fn handle_message(&self, msg: ProtoMsg, state: &mut ConnState) -> Flow {
        match msg {
            ProtoMsg::Ping => {
                let _ = self.out_tx.send(ProtoMsg::Pong);
            }
            ProtoMsg::Pong => {}
            ProtoMsg::ResponseOk { tunnel_id, data } => match TunnelRequest::from_bytes(&data) {
                Ok(final_request) => {
                    state.tunnel_id = Some(tunnel_id);
                    state.seen_tunnel = Some(tunnel_id);
                    state.inactive = None;
                    info!("tunnel opened: {} (id {})", final_request, tunnel_id);
                    self.state_listener.on_connected(&final_request);
                    state.request = Some(final_request);
                }
                Err(err) => warn!("undecodable request in ResponseOk: {}", err),
            },
            ProtoMsg::ResponseErr { data } => {
                let cause = String::from_utf8_lossy(&data).into_owned();
                debug!("tunnel rejected: {}", cause);
                state.tunnel_id = None;
                state.request = None;
                state.inactive = Some(InactiveReason {
                    forced: false,
                    cause,
                });
                return Flow::Close;
            }
            ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                data,
            } => {
                state.tunnel_id = Some(tunnel_id);
                state.session_id = Some(session_id);
                state.seen_tunnel = Some(tunnel_id);
                if let Some(request) = &state.request {
                    self.pool.write(
                        (tunnel_id, session_id),
                        &request.local_addr,
                        request.local_port,
                        data,
                        &self.out_tx,
                    );
                }
            }
            ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                data,
            } => {
                state.tunnel_id = Some(tunnel_id);
                state.session_id = Some(session_id);
                state.seen_tunnel = Some(tunnel_id);
                match RemoteConnection::from_bytes(&data) {
                    Ok(conn) => self.remote_listener.on_remote_connected(&conn),
                    Err(err) => debug!("undecodable RemoteConnection: {}", err),
                }
                if let Some(request) = &state.request {
                    self.pool.warm(
                        (tunnel_id, session_id),
                        &request.local_addr,
                        request.local_port,
                        &self.out_tx,
                    );
                }
            }
            ProtoMsg::RemoteDisconnect {
                tunnel_id,
                session_id,
                data,
            } => {
                if let Ok(conn) = RemoteConnection::from_bytes(&data) {
                    self.remote_listener.on_remote_disconnected(&conn);
                }
                if let Some(conn) = self.pool.remove(&(tunnel_id, session_id)) {
                    conn.close_graceful();
                }
            }
            ProtoMsg::ForceOff => {
                debug!("forced off by server");
                state.tunnel_id = None;
                state.request = None;
                state.inactive = Some(InactiveReason {
                    forced: true,
                    cause: "ForceOff".to_string(),
                });
                let _ = self.out_tx.send(ProtoMsg::ForceOffReply);
                return Flow::Close;
            }
            // server-bound messages; nothing to do on the client
            ProtoMsg::Request { .. } | ProtoMsg::LocalDisconnect { .. } | ProtoMsg::ForceOffReply => {}
        }
        Flow::Continue
    }
}

async fn write_control<S>(
    mut sink: SplitSink<Framed<S, ProtoCodec>, ProtoMsg>,
    mut out_rx: mpsc::UnboundedReceiver<ProtoMsg>,
    mut close_rx: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut close_rx => {
                // drain anything queued before the close was requested
                while let Ok(msg) = out_rx.try_recv() {
                    if sink.feed(msg).await.is_err() {
                        break;
                    }
                }
                let _ = sink.flush().await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
