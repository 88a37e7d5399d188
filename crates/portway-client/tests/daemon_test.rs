//! State-machine scenarios for the client tunnel daemon
//!
//! A scripted in-process "server" drives the control connection with real
//! protocol frames and asserts on what the daemon sends back and on what
//! reaches the local service.

use futures::{SinkExt, StreamExt};
use portway_client::{
    ClientConfig, InactiveReason, RemoteListener, TunnelClient, TunnelStateListener,
};
use portway_proto::{ProtoCodec, ProtoMsg, RemoteConnection, TunnelRequest};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

type Control = Framed<TcpStream, ProtoCodec>;

#[derive(Default)]
struct Recorder {
    connected: Mutex<Option<TunnelRequest>>,
    inactive: Mutex<Option<(Option<TunnelRequest>, Option<InactiveReason>)>>,
    remote_connected: Mutex<Vec<RemoteConnection>>,
    remote_disconnected: Mutex<Vec<RemoteConnection>>,
}

impl TunnelStateListener for Recorder {
    fn on_connected(&self, request: &TunnelRequest) {
        *self.connected.lock().unwrap() = Some(request.clone());
    }

    fn on_inactive(&self, request: Option<&TunnelRequest>, reason: Option<&InactiveReason>) {
        *self.inactive.lock().unwrap() = Some((request.cloned(), reason.cloned()));
    }
}

impl RemoteListener for Recorder {
    fn on_remote_connected(&self, conn: &RemoteConnection) {
        self.remote_connected.lock().unwrap().push(*conn);
    }

    fn on_remote_disconnected(&self, conn: &RemoteConnection) {
        self.remote_disconnected.lock().unwrap().push(*conn);
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Local service that hands accepted sockets to the test.
async fn spawn_local_service() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    if tx.send(socket).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    (addr, rx)
}

/// Accept the daemon's control connection and consume its tunnel request.
async fn accept_control(listener: &TcpListener) -> (Control, TunnelRequest) {
    let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut control = Framed::new(socket, ProtoCodec::new());
    let first = timeout(Duration::from_secs(5), control.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let request = match first {
        ProtoMsg::Request { data } => TunnelRequest::from_bytes(&data).unwrap(),
        other => panic!("expected Request, got {:?}", other),
    };
    (control, request)
}

async fn next_msg(control: &mut Control) -> ProtoMsg {
    timeout(Duration::from_secs(5), control.next())
        .await
        .expect("timed out waiting for client message")
        .expect("control connection closed unexpectedly")
        .unwrap()
}

fn client_for(addr: SocketAddr, recorder: Arc<Recorder>) -> TunnelClient {
    TunnelClient::new(ClientConfig::new(addr.to_string()))
        .with_state_listener(recorder.clone())
        .with_remote_listener(recorder)
}

#[tokio::test]
async fn test_establishes_and_relays_transfer() {
    let (local_addr, mut local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder.clone());
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let _handle = client.connect(request.clone()).await.unwrap();

    let (mut control, received) = accept_control(&server).await;
    assert_eq!(received, request);

    // accept with a rewritten port
    let final_request = request.with_remote_port(5000);
    control
        .send(ProtoMsg::response_ok(7, &final_request))
        .await
        .unwrap();
    wait_for("on_connected", || {
        recorder.connected.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(
        recorder.connected.lock().unwrap().clone().unwrap(),
        final_request
    );

    // payload for session 1 opens the local connection and lands verbatim
    control
        .send(ProtoMsg::transfer(7, 1, b"GET /".as_ref().into()))
        .await
        .unwrap();
    let mut local1 = timeout(Duration::from_secs(5), local_sockets.recv())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(3), local1.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"GET /");

    // a second, independent session
    control
        .send(ProtoMsg::transfer(7, 2, b"second".as_ref().into()))
        .await
        .unwrap();
    let mut local2 = timeout(Duration::from_secs(5), local_sockets.recv())
        .await
        .unwrap()
        .unwrap();
    let mut buf2 = [0u8; 6];
    timeout(Duration::from_secs(3), local2.read_exact(&mut buf2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf2, b"second");

    // the local service's response comes back tagged with session 1
    use tokio::io::AsyncWriteExt;
    local1.write_all(b"200 OK").await.unwrap();
    match next_msg(&mut control).await {
        ProtoMsg::Transfer {
            tunnel_id,
            session_id,
            data,
        } => {
            assert_eq!((tunnel_id, session_id), (7, 1));
            assert_eq!(&data[..], b"200 OK");
        }
        other => panic!("expected Transfer, got {:?}", other),
    }

    // remote hangup tears down session 1 only
    let remote = RemoteConnection::new("203.0.113.9:40122".parse().unwrap());
    control
        .send(ProtoMsg::remote_disconnect(7, 1, &remote))
        .await
        .unwrap();
    let n = timeout(Duration::from_secs(3), local1.read(&mut [0u8; 16]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "session 1 local socket closed");
    wait_for("remote disconnect observer", || {
        !recorder.remote_disconnected.lock().unwrap().is_empty()
    })
    .await;

    control
        .send(ProtoMsg::transfer(7, 2, b" again".as_ref().into()))
        .await
        .unwrap();
    let mut buf3 = [0u8; 6];
    timeout(Duration::from_secs(3), local2.read_exact(&mut buf3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf3, b" again", "session 2 unaffected");
}

#[tokio::test]
async fn test_remote_connected_prewarms_local_connection() {
    let (local_addr, mut local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder.clone());
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let _handle = client.connect(request.clone()).await.unwrap();

    let (mut control, _) = accept_control(&server).await;
    control
        .send(ProtoMsg::response_ok(3, &request.with_remote_port(6000)))
        .await
        .unwrap();

    let remote = RemoteConnection::new("198.51.100.4:50000".parse().unwrap());
    control
        .send(ProtoMsg::remote_connected(3, 1, &remote))
        .await
        .unwrap();

    // local connection opens before any payload arrives
    let _local = timeout(Duration::from_secs(5), local_sockets.recv())
        .await
        .unwrap()
        .unwrap();
    wait_for("remote connected observer", || {
        recorder.remote_connected.lock().unwrap().first() == Some(&remote)
    })
    .await;
}

#[tokio::test]
async fn test_response_err_closes_with_cause() {
    let (local_addr, mut local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder.clone());
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let handle = client.connect(request).await.unwrap();

    let (mut control, _) = accept_control(&server).await;
    control
        .send(ProtoMsg::response_err("Bad Auth Token"))
        .await
        .unwrap();

    handle.closed().await;
    let (request, reason) = recorder.inactive.lock().unwrap().clone().unwrap();
    assert!(request.is_none());
    let reason = reason.expect("rejection recorded");
    assert!(!reason.forced);
    assert_eq!(reason.cause, "Bad Auth Token");

    // no local connection was ever opened
    assert!(local_sockets.try_recv().is_err());

    // and the daemon closed its end
    let eof = timeout(Duration::from_secs(5), control.next()).await.unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_force_off_acknowledged_then_closed() {
    let (local_addr, _local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder.clone());
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let handle = client.connect(request.clone()).await.unwrap();

    let (mut control, _) = accept_control(&server).await;
    control
        .send(ProtoMsg::response_ok(9, &request.with_remote_port(7000)))
        .await
        .unwrap();
    wait_for("on_connected", || {
        recorder.connected.lock().unwrap().is_some()
    })
    .await;

    control.send(ProtoMsg::ForceOff).await.unwrap();

    // exactly one reply, then EOF
    assert_eq!(next_msg(&mut control).await, ProtoMsg::ForceOffReply);
    let eof = timeout(Duration::from_secs(5), control.next()).await.unwrap();
    assert!(eof.is_none());

    handle.closed().await;
    let (_, reason) = recorder.inactive.lock().unwrap().clone().unwrap();
    let reason = reason.expect("eviction recorded");
    assert!(reason.forced);
    assert_eq!(reason.cause, "ForceOff");
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (local_addr, _local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder);
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let _handle = client.connect(request).await.unwrap();

    let (mut control, _) = accept_control(&server).await;
    control.send(ProtoMsg::Ping).await.unwrap();
    assert_eq!(next_msg(&mut control).await, ProtoMsg::Pong);
}

#[tokio::test]
async fn test_client_heartbeats_on_interval() {
    let (local_addr, _local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let config = ClientConfig::new(server.local_addr().unwrap().to_string())
        .with_heartbeat_interval(Duration::from_millis(100));
    let client = TunnelClient::new(config).with_state_listener(recorder);
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let _handle = client.connect(request).await.unwrap();

    let (mut control, _) = accept_control(&server).await;
    assert_eq!(next_msg(&mut control).await, ProtoMsg::Ping);
    control.send(ProtoMsg::Pong).await.unwrap();
    assert_eq!(next_msg(&mut control).await, ProtoMsg::Ping);
}

#[tokio::test]
async fn test_server_drop_reports_plain_inactive() {
    let (local_addr, _local_sockets) = spawn_local_service().await;
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recorder = Arc::new(Recorder::default());

    let client = client_for(server.local_addr().unwrap(), recorder.clone());
    let request = TunnelRequest::tcp("127.0.0.1", local_addr.port(), 0);
    let handle = client.connect(request).await.unwrap();

    let (control, _) = accept_control(&server).await;
    drop(control);

    handle.closed().await;
    let (request, reason) = recorder.inactive.lock().unwrap().clone().unwrap();
    assert!(request.is_none());
    assert!(reason.is_none(), "plain drop carries no inactivity context");
}
