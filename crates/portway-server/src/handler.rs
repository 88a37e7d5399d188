//! Control-connection handler and per-tunnel session fan-out
//!
//! One `handle_control` invocation per accepted control connection. The
//! first message must carry the tunnel request; rejections are delivered as
//! `ResponseErr` before the connection closes. Accepted TCP tunnels get a
//! public listener whose remote connections become sessions multiplexed
//! over the control connection.

use crate::interceptor::TunnelRequestInterceptor;
use crate::port::PortAllocator;
use crate::registry::{TunnelEntry, TunnelRegistry};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use portway_proto::{
    ProtoCodec, ProtoMsg, ProtocolError, RemoteConnection, SessionId, TunnelId, TunnelRequest,
    TunnelType,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 8192;

pub(crate) struct ServerCtx {
    pub interceptor: Arc<dyn TunnelRequestInterceptor>,
    pub allocator: Arc<PortAllocator>,
    pub registry: Arc<TunnelRegistry>,
    pub read_idle_timeout: Duration,
    pub shutdown: CancellationToken,
}

enum SessionCmd {
    Data(Bytes),
    FlushClose,
}

type SessionMap = Arc<DashMap<SessionId, mpsc::UnboundedSender<SessionCmd>>>;

pub(crate) async fn handle_control<S>(stream: S, peer_addr: SocketAddr, ctx: Arc<ServerCtx>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, ProtoCodec::new());

    let request = match read_request(&mut framed, ctx.read_idle_timeout).await {
        Ok(request) => request,
        Err(reject) => {
            debug!("control connection from {} rejected: {}", peer_addr, reject);
            let _ = framed.send(ProtoMsg::response_err(&reject.to_string())).await;
            let _ = framed.close().await;
            return;
        }
    };

    let accepted = match ctx.interceptor.handle_tunnel_request(&request) {
        Ok(accepted) => accepted,
        Err(reject) => {
            debug!("tunnel request {} rejected: {}", request, reject);
            let _ = framed.send(ProtoMsg::response_err(&reject.to_string())).await;
            let _ = framed.close().await;
            return;
        }
    };

    // a port the interceptor allocated must go back to the pool on teardown
    let allocated_port = (request.tunnel_type == TunnelType::Tcp && request.remote_port == 0)
        .then_some(accepted.remote_port);

    // a specific-port re-request supersedes the tunnel currently holding it
    if accepted.tunnel_type == TunnelType::Tcp {
        if let Some(holder) = ctx.registry.find_tcp_port(accepted.remote_port) {
            info!(
                "tunnel {} superseded by new request for port {}",
                holder, accepted.remote_port
            );
            ctx.registry.force_off(holder);
        }
    }

    let endpoint = match accepted.tunnel_type {
        TunnelType::Tcp => match bind_endpoint(accepted.remote_port).await {
            Ok(listener) => Some(listener),
            Err(err) => {
                warn!(
                    "failed to bind public port {}: {}",
                    accepted.remote_port, err
                );
                if let Some(port) = allocated_port {
                    ctx.allocator.release(port);
                }
                let reason = format!("remote port {} unavailable", accepted.remote_port);
                let _ = framed.send(ProtoMsg::response_err(&reason)).await;
                let _ = framed.close().await;
                return;
            }
        },
        _ => None,
    };

    let tunnel_id = ctx.registry.next_tunnel_id();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let (sink, mut stream) = framed.split();
    let writer = tokio::spawn(write_control(sink, ctrl_rx, close_rx));

    let endpoint_cancel = ctx.shutdown.child_token();
    let sessions: SessionMap = Arc::new(DashMap::new());

    let _ = ctrl_tx.send(ProtoMsg::response_ok(tunnel_id, &accepted));
    info!("tunnel {} opened for {}: {}", tunnel_id, peer_addr, accepted);

    ctx.registry.register(TunnelEntry::new(
        tunnel_id,
        accepted,
        ctrl_tx.clone(),
        endpoint_cancel.clone(),
    ));

    if let Some(listener) = endpoint {
        tokio::spawn(run_endpoint(
            listener,
            tunnel_id,
            ctrl_tx.clone(),
            sessions.clone(),
            endpoint_cancel.clone(),
        ));
    }

    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            frame = tokio::time::timeout(ctx.read_idle_timeout, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                debug!("tunnel {} control connection idle, closing", tunnel_id);
                break;
            }
            Ok(None) => {
                debug!("tunnel {} control connection closed", tunnel_id);
                break;
            }
            Ok(Some(Err(err))) => {
                debug!("tunnel {} control connection error: {}", tunnel_id, err);
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                ProtoMsg::Ping => {
                    let _ = ctrl_tx.send(ProtoMsg::Pong);
                }
                ProtoMsg::Pong => {}
                ProtoMsg::Transfer {
                    tunnel_id: owner,
                    session_id,
                    data,
                } if owner == tunnel_id => {
                    if let Some(session) = sessions.get(&session_id) {
                        let _ = session.send(SessionCmd::Data(data));
                    }
                }
                ProtoMsg::LocalDisconnect {
                    tunnel_id: owner,
                    session_id,
                } if owner == tunnel_id => {
                    debug!("tunnel {} session {} local disconnect", tunnel_id, session_id);
                    if let Some(session) = sessions.get(&session_id) {
                        let _ = session.send(SessionCmd::FlushClose);
                    }
                }
                ProtoMsg::ForceOffReply => {
                    debug!("tunnel {} acknowledged force off", tunnel_id);
                    break;
                }
                _ => {}
            },
        }
    }

    endpoint_cancel.cancel();
    ctx.registry.unregister(tunnel_id);
    if let Some(port) = allocated_port {
        ctx.allocator.release(port);
    }
    let _ = close_tx.send(());
    let _ = writer.await;
    info!("tunnel {} closed", tunnel_id);
}

async fn read_request<S>(
    framed: &mut Framed<S, ProtoCodec>,
    idle: Duration,
) -> Result<TunnelRequest, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = tokio::time::timeout(idle, framed.next())
        .await
        .map_err(|_| ProtocolError::Malformed("no tunnel request received".to_string()))?;
    match first {
        Some(Ok(ProtoMsg::Request { data })) => TunnelRequest::from_bytes(&data),
        Some(Ok(_)) => Err(ProtocolError::Malformed(
            "expected tunnel request".to_string(),
        )),
        Some(Err(err)) => Err(err),
        None => Err(ProtocolError::Malformed(
            "connection closed before request".to_string(),
        )),
    }
}

/// Bind the public endpoint. A superseded tunnel's listener closes
/// asynchronously, so AddrInUse is retried briefly.
async fn bind_endpoint(port: u16) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for _ in 0..10 {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use")))
}

async fn run_endpoint(
    listener: TcpListener,
    tunnel_id: TunnelId,
    ctrl_tx: mpsc::UnboundedSender<ProtoMsg>,
    sessions: SessionMap,
    cancel: CancellationToken,
) {
    let mut next_session: SessionId = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, remote_addr)) => {
                    next_session += 1;
                    let session_id = next_session;
                    debug!("tunnel {} session {} from {}", tunnel_id, session_id, remote_addr);
                    tokio::spawn(run_session(
                        socket,
                        remote_addr,
                        tunnel_id,
                        session_id,
                        ctrl_tx.clone(),
                        sessions.clone(),
                        cancel.clone(),
                    ));
                }
                Err(err) => {
                    warn!("tunnel {} accept failed: {}", tunnel_id, err);
                }
            }
        }
    }
}

async fn run_session(
    socket: TcpStream,
    remote_addr: SocketAddr,
    tunnel_id: TunnelId,
    session_id: SessionId,
    ctrl_tx: mpsc::UnboundedSender<ProtoMsg>,
    sessions: SessionMap,
    cancel: CancellationToken,
) {
    let remote = RemoteConnection::new(remote_addr);
    let (tx, mut rx) = mpsc::unbounded_channel();
    sessions.insert(session_id, tx);
    let _ = ctrl_tx.send(ProtoMsg::remote_connected(tunnel_id, session_id, &remote));

    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(SessionCmd::Data(data)) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(SessionCmd::FlushClose) => {
                    let _ = write_half.shutdown().await;
                    break;
                }
                None => break,
            },
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    let _ = ctrl_tx.send(ProtoMsg::transfer(tunnel_id, session_id, data));
                }
            }
        }
    }

    sessions.remove(&session_id);
    if !cancel.is_cancelled() {
        let _ = ctrl_tx.send(ProtoMsg::remote_disconnect(tunnel_id, session_id, &remote));
    }
    debug!("tunnel {} session {} ended", tunnel_id, session_id);
}

async fn write_control<S>(
    mut sink: SplitSink<Framed<S, ProtoCodec>, ProtoMsg>,
    mut ctrl_rx: mpsc::UnboundedReceiver<ProtoMsg>,
    mut close_rx: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = ctrl_rx.recv() => match msg {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut close_rx => {
                // drain anything queued before the close was requested
                while let Ok(msg) = ctrl_rx.try_recv() {
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
