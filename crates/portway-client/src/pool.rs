//! Local connection pool
//!
//! Maps `(TunnelId, SessionId)` to an on-demand connection to the local
//! service. The first acquisition for a session starts exactly one async
//! connect; payload arriving while the connect is in flight is queued in
//! order and flushed once the socket arrives. Connect failures are reported
//! once, as a `LocalDisconnect` on the control channel for the transfer
//! path, and are never retried.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portway_proto::{ProtoMsg, SessionId, TunnelId};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

/// Key of one pooled local connection.
pub type SessionKey = (TunnelId, SessionId);

/// Sender half of a control connection's outbound message queue.
pub type ControlSender = mpsc::UnboundedSender<ProtoMsg>;

/// The local service could not be reached (or was lost) for a session.
#[derive(Debug, Clone, Error)]
#[error("local service unreachable: {0}")]
pub struct LocalUnreachable(pub String);

const READ_BUF_SIZE: usize = 8192;

#[derive(Debug)]
enum WriteCmd {
    Data(Bytes),
    Shutdown,
}

/// Handle to one pooled local connection. Cloning shares the underlying
/// relay tasks.
#[derive(Debug, Clone)]
pub struct LocalConn {
    tx: mpsc::UnboundedSender<WriteCmd>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl LocalConn {
    /// Queue payload for the local service. Writes are applied in order.
    pub fn write(&self, data: Bytes) {
        let _ = self.tx.send(WriteCmd::Data(data));
    }

    /// Flush queued writes, send FIN, and stop relaying.
    pub fn close_graceful(&self) {
        let _ = self.tx.send(WriteCmd::Shutdown);
        self.reader.abort();
    }

    /// Drop the connection immediately without flushing.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
struct Pending {
    queued: Vec<Bytes>,
    waiters: Vec<oneshot::Sender<Result<LocalConn, LocalUnreachable>>>,
    /// Set once a transfer write is queued: a failed connect must then be
    /// surfaced to the server as a `LocalDisconnect`.
    notify_fail: bool,
}

enum SessionEntry {
    Connecting(Pending),
    Ready(LocalConn),
}

enum AcquireMode {
    Warm,
    Write(Bytes),
    Wait(oneshot::Sender<Result<LocalConn, LocalUnreachable>>),
}

/// Pool of local-service connections, one per open session.
#[derive(Clone, Default)]
pub struct LocalPool {
    entries: Arc<DashMap<SessionKey, SessionEntry>>,
}

impl LocalPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfer path: write `data` to the session's local connection,
    /// opening it first if needed. Payload queued while the connect is in
    /// flight is flushed in arrival order.
    pub fn write(
        &self,
        key: SessionKey,
        local_addr: &str,
        local_port: u16,
        data: Bytes,
        control: &ControlSender,
    ) {
        self.ensure(key, local_addr, local_port, control, AcquireMode::Write(data));
    }

    /// Pre-warm the session's local connection without writing to it.
    /// A failed connect here stays silent until a write is attempted.
    pub fn warm(&self, key: SessionKey, local_addr: &str, local_port: u16, control: &ControlSender) {
        self.ensure(key, local_addr, local_port, control, AcquireMode::Warm);
    }

    /// Awaitable acquisition: resolves once the session's connection is
    /// usable, or with the connect failure. Concurrent calls share a single
    /// connect attempt.
    pub async fn acquire(
        &self,
        key: SessionKey,
        local_addr: &str,
        local_port: u16,
        control: &ControlSender,
    ) -> Result<LocalConn, LocalUnreachable> {
        let (tx, rx) = oneshot::channel();
        self.ensure(key, local_addr, local_port, control, AcquireMode::Wait(tx));
        rx.await
            .map_err(|_| LocalUnreachable("session torn down".to_string()))?
    }

    /// Detach the session's connection without closing it; the caller
    /// decides between graceful close and abort.
    pub fn remove(&self, key: &SessionKey) -> Option<LocalConn> {
        self.entries.remove(key).and_then(|(_, entry)| match entry {
            SessionEntry::Ready(conn) => Some(conn),
            SessionEntry::Connecting(pending) => {
                let cause = LocalUnreachable("session torn down".to_string());
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(cause.clone()));
                }
                None
            }
        })
    }

    /// Detach every connection owned by `tunnel_id`; used when the control
    /// connection goes inactive.
    pub fn remove_all(&self, tunnel_id: TunnelId) -> Vec<LocalConn> {
        let keys: Vec<SessionKey> = self
            .entries
            .iter()
            .map(|entry| *entry.key())
            .filter(|(owner, _)| *owner == tunnel_id)
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure(
        &self,
        key: SessionKey,
        local_addr: &str,
        local_port: u16,
        control: &ControlSender,
        mode: AcquireMode,
    ) {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                SessionEntry::Ready(conn) => match mode {
                    AcquireMode::Warm => {}
                    AcquireMode::Write(data) => conn.write(data),
                    AcquireMode::Wait(tx) => {
                        let _ = tx.send(Ok(conn.clone()));
                    }
                },
                SessionEntry::Connecting(pending) => match mode {
                    AcquireMode::Warm => {}
                    AcquireMode::Write(data) => {
                        pending.queued.push(data);
                        pending.notify_fail = true;
                    }
                    AcquireMode::Wait(tx) => pending.waiters.push(tx),
                },
            },
            Entry::Vacant(vacant) => {
                let mut pending = Pending::default();
                match mode {
                    AcquireMode::Warm => {}
                    AcquireMode::Write(data) => {
                        pending.queued.push(data);
                        pending.notify_fail = true;
                    }
                    AcquireMode::Wait(tx) => pending.waiters.push(tx),
                }
                vacant.insert(SessionEntry::Connecting(pending));
                self.spawn_connect(key, local_addr.to_string(), local_port, control.clone());
            }
        }
    }

    fn spawn_connect(
        &self,
        key: SessionKey,
        local_addr: String,
        local_port: u16,
        control: ControlSender,
    ) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            match TcpStream::connect((local_addr.as_str(), local_port)).await {
                Ok(stream) => {
                    let conn = spawn_relay(stream, key, control, entries.clone());
                    match entries.entry(key) {
                        Entry::Occupied(mut occupied) => {
                            let prev = std::mem::replace(
                                occupied.get_mut(),
                                SessionEntry::Ready(conn.clone()),
                            );
                            if let SessionEntry::Connecting(pending) = prev {
                                for data in pending.queued {
                                    conn.write(data);
                                }
                                for waiter in pending.waiters {
                                    let _ = waiter.send(Ok(conn.clone()));
                                }
                            }
                        }
                        // session torn down while the connect was in flight
                        Entry::Vacant(_) => conn.abort(),
                    }
                }
                Err(err) => {
                    debug!(
                        "local connect {}:{} failed: {}",
                        local_addr, local_port, err
                    );
                    if let Some((_, SessionEntry::Connecting(pending))) = entries.remove(&key) {
                        let cause = LocalUnreachable(err.to_string());
                        for waiter in pending.waiters {
                            let _ = waiter.send(Err(cause.clone()));
                        }
                        if pending.notify_fail {
                            let _ = control.send(ProtoMsg::LocalDisconnect {
                                tunnel_id: key.0,
                                session_id: key.1,
                            });
                        }
                    }
                }
            }
        });
    }
}

fn spawn_relay(
    stream: TcpStream,
    key: SessionKey,
    control: ControlSender,
    entries: Arc<DashMap<SessionKey, SessionEntry>>,
) -> LocalConn {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_local(write_half, rx));
    let reader = tokio::spawn(read_local(read_half, key, control, entries));
    LocalConn {
        tx,
        reader: reader.abort_handle(),
        writer: writer.abort_handle(),
    }
}

async fn write_local(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriteCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            WriteCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

async fn read_local(
    mut read_half: OwnedReadHalf,
    key: SessionKey,
    control: ControlSender,
    entries: Arc<DashMap<SessionKey, SessionEntry>>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if control
                    .send(ProtoMsg::transfer(key.0, key.1, data))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    // local service went away: tear the session down once
    if let Some((_, entry)) = entries.remove(&key) {
        let _ = control.send(ProtoMsg::LocalDisconnect {
            tunnel_id: key.0,
            session_id: key.1,
        });
        if let SessionEntry::Ready(conn) = entry {
            conn.close_graceful();
        }
    }
}
