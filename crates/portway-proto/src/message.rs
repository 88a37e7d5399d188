//! Protocol message types
//!
//! A `ProtoMsg` is the unit exchanged on a control connection: a one-byte
//! type tag followed by tag-specific fields. Structured payloads
//! (`TunnelRequest`, `RemoteConnection`) travel as opaque bytes and are
//! decoded by the handler that consumes them, so a bad payload only affects
//! the message it arrived in.

use crate::{ProtocolError, RemoteConnection, SessionId, TunnelId, TunnelRequest};
use bytes::{Buf, BufMut, Bytes, BytesMut};

mod tag {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const REQUEST: u8 = 0x10;
    pub const RESPONSE_OK: u8 = 0x20;
    pub const RESPONSE_ERR: u8 = 0x21;
    pub const TRANSFER: u8 = 0x30;
    pub const REMOTE_CONNECTED: u8 = 0x40;
    pub const REMOTE_DISCONNECT: u8 = 0x41;
    pub const LOCAL_DISCONNECT: u8 = 0x42;
    pub const FORCE_OFF: u8 = 0x50;
    pub const FORCE_OFF_REPLY: u8 = 0x51;
}

/// Main tunnel protocol message enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoMsg {
    /// Liveness probe; either peer may send it.
    Ping,
    /// Reply to `Ping`.
    Pong,
    /// Client asks the server to open a tunnel. Payload is a serialized
    /// `TunnelRequest`.
    Request { data: Bytes },
    /// Tunnel accepted. Payload is the final (possibly rewritten) request.
    ResponseOk { tunnel_id: TunnelId, data: Bytes },
    /// Tunnel rejected. Payload is UTF-8 error text; the connection closes
    /// after delivery.
    ResponseErr { data: Bytes },
    /// Bulk payload for one session, both directions.
    Transfer {
        tunnel_id: TunnelId,
        session_id: SessionId,
        data: Bytes,
    },
    /// A remote user connection opened. Payload is a serialized
    /// `RemoteConnection`.
    RemoteConnected {
        tunnel_id: TunnelId,
        session_id: SessionId,
        data: Bytes,
    },
    /// A remote user connection closed.
    RemoteDisconnect {
        tunnel_id: TunnelId,
        session_id: SessionId,
        data: Bytes,
    },
    /// Client lost (or could not reach) the local service for this session.
    LocalDisconnect {
        tunnel_id: TunnelId,
        session_id: SessionId,
    },
    /// Server evicts the tunnel; client acknowledges then closes.
    ForceOff,
    /// Acknowledgement of `ForceOff`.
    ForceOffReply,
}

impl ProtoMsg {
    pub fn request(request: &TunnelRequest) -> Self {
        ProtoMsg::Request {
            data: request.to_bytes().into(),
        }
    }

    pub fn response_ok(tunnel_id: TunnelId, request: &TunnelRequest) -> Self {
        ProtoMsg::ResponseOk {
            tunnel_id,
            data: request.to_bytes().into(),
        }
    }

    pub fn response_err(reason: &str) -> Self {
        ProtoMsg::ResponseErr {
            data: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn transfer(tunnel_id: TunnelId, session_id: SessionId, data: Bytes) -> Self {
        ProtoMsg::Transfer {
            tunnel_id,
            session_id,
            data,
        }
    }

    pub fn remote_connected(
        tunnel_id: TunnelId,
        session_id: SessionId,
        conn: &RemoteConnection,
    ) -> Self {
        ProtoMsg::RemoteConnected {
            tunnel_id,
            session_id,
            data: conn.to_bytes().into(),
        }
    }

    pub fn remote_disconnect(
        tunnel_id: TunnelId,
        session_id: SessionId,
        conn: &RemoteConnection,
    ) -> Self {
        ProtoMsg::RemoteDisconnect {
            tunnel_id,
            session_id,
            data: conn.to_bytes().into(),
        }
    }

    /// Encode the message body (everything after the length prefix).
    /// Encoding is total for well-formed in-memory messages.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload_len() + 16);
        match self {
            ProtoMsg::Ping => buf.put_u8(tag::PING),
            ProtoMsg::Pong => buf.put_u8(tag::PONG),
            ProtoMsg::Request { data } => {
                buf.put_u8(tag::REQUEST);
                buf.put_slice(data);
            }
            ProtoMsg::ResponseOk { tunnel_id, data } => {
                buf.put_u8(tag::RESPONSE_OK);
                buf.put_u64(*tunnel_id);
                buf.put_slice(data);
            }
            ProtoMsg::ResponseErr { data } => {
                buf.put_u8(tag::RESPONSE_ERR);
                buf.put_slice(data);
            }
            ProtoMsg::Transfer {
                tunnel_id,
                session_id,
                data,
            } => {
                buf.put_u8(tag::TRANSFER);
                buf.put_u64(*tunnel_id);
                buf.put_u64(*session_id);
                buf.put_slice(data);
            }
            ProtoMsg::RemoteConnected {
                tunnel_id,
                session_id,
                data,
            } => {
                buf.put_u8(tag::REMOTE_CONNECTED);
                buf.put_u64(*tunnel_id);
                buf.put_u64(*session_id);
                buf.put_slice(data);
            }
            ProtoMsg::RemoteDisconnect {
                tunnel_id,
                session_id,
                data,
            } => {
                buf.put_u8(tag::REMOTE_DISCONNECT);
                buf.put_u64(*tunnel_id);
                buf.put_u64(*session_id);
                buf.put_slice(data);
            }
            ProtoMsg::LocalDisconnect {
                tunnel_id,
                session_id,
            } => {
                buf.put_u8(tag::LOCAL_DISCONNECT);
                buf.put_u64(*tunnel_id);
                buf.put_u64(*session_id);
            }
            ProtoMsg::ForceOff => buf.put_u8(tag::FORCE_OFF),
            ProtoMsg::ForceOffReply => buf.put_u8(tag::FORCE_OFF_REPLY),
        }
        buf.freeze()
    }

    /// Decode a message body. Returns `Ok(None)` for an unrecognized tag so
    /// receivers can skip frames from newer protocol revisions.
    pub fn decode(mut buf: Bytes) -> Result<Option<ProtoMsg>, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::Truncated("frame"));
        }
        let msg = match buf.get_u8() {
            tag::PING => ProtoMsg::Ping,
            tag::PONG => ProtoMsg::Pong,
            tag::REQUEST => ProtoMsg::Request { data: buf },
            tag::RESPONSE_OK => {
                need(&buf, 8, "ResponseOk")?;
                ProtoMsg::ResponseOk {
                    tunnel_id: buf.get_u64(),
                    data: buf,
                }
            }
            tag::RESPONSE_ERR => ProtoMsg::ResponseErr { data: buf },
            tag::TRANSFER => {
                need(&buf, 16, "Transfer")?;
                ProtoMsg::Transfer {
                    tunnel_id: buf.get_u64(),
                    session_id: buf.get_u64(),
                    data: buf,
                }
            }
            tag::REMOTE_CONNECTED => {
                need(&buf, 16, "RemoteConnected")?;
                ProtoMsg::RemoteConnected {
                    tunnel_id: buf.get_u64(),
                    session_id: buf.get_u64(),
                    data: buf,
                }
            }
            tag::REMOTE_DISCONNECT => {
                need(&buf, 16, "RemoteDisconnect")?;
                ProtoMsg::RemoteDisconnect {
                    tunnel_id: buf.get_u64(),
                    session_id: buf.get_u64(),
                    data: buf,
                }
            }
            tag::LOCAL_DISCONNECT => {
                need(&buf, 16, "LocalDisconnect")?;
                ProtoMsg::LocalDisconnect {
                    tunnel_id: buf.get_u64(),
                    session_id: buf.get_u64(),
                }
            }
            tag::FORCE_OFF => ProtoMsg::ForceOff,
            tag::FORCE_OFF_REPLY => ProtoMsg::ForceOffReply,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn payload_len(&self) -> usize {
        match self {
            ProtoMsg::Request { data }
            | ProtoMsg::ResponseOk { data, .. }
            | ProtoMsg::ResponseErr { data }
            | ProtoMsg::Transfer { data, .. }
            | ProtoMsg::RemoteConnected { data, .. }
            | ProtoMsg::RemoteDisconnect { data, .. } => data.len(),
            _ => 0,
        }
    }
}

fn need(buf: &Bytes, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ProtoMsg) -> ProtoMsg {
        ProtoMsg::decode(msg.encode())
            .unwrap()
            .expect("known tag decodes")
    }

    #[test]
    fn test_heartbeat_round_trip() {
        assert_eq!(round_trip(ProtoMsg::Ping), ProtoMsg::Ping);
        assert_eq!(round_trip(ProtoMsg::Pong), ProtoMsg::Pong);
    }

    #[test]
    fn test_request_round_trip() {
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 0).with_auth_token("secret");
        let msg = ProtoMsg::request(&request);
        if let ProtoMsg::Request { data } = round_trip(msg) {
            assert_eq!(TunnelRequest::from_bytes(&data).unwrap(), request);
        } else {
            panic!("Expected Request message");
        }
    }

    #[test]
    fn test_response_ok_round_trip() {
        let request = TunnelRequest::tcp("127.0.0.1", 8080, 5000);
        let msg = ProtoMsg::response_ok(7, &request);
        if let ProtoMsg::ResponseOk { tunnel_id, data } = round_trip(msg) {
            assert_eq!(tunnel_id, 7);
            assert_eq!(TunnelRequest::from_bytes(&data).unwrap(), request);
        } else {
            panic!("Expected ResponseOk message");
        }
    }

    #[test]
    fn test_response_err_round_trip() {
        let msg = ProtoMsg::response_err("Bad Auth Token");
        if let ProtoMsg::ResponseErr { data } = round_trip(msg) {
            assert_eq!(&data[..], b"Bad Auth Token");
        } else {
            panic!("Expected ResponseErr message");
        }
    }

    #[test]
    fn test_transfer_round_trip() {
        let payload = Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n");
        let msg = ProtoMsg::transfer(42, 3, payload.clone());
        if let ProtoMsg::Transfer {
            tunnel_id,
            session_id,
            data,
        } = round_trip(msg)
        {
            assert_eq!(tunnel_id, 42);
            assert_eq!(session_id, 3);
            assert_eq!(data, payload);
        } else {
            panic!("Expected Transfer message");
        }
    }

    #[test]
    fn test_transfer_round_trip_empty_and_large_payload() {
        for payload in [Bytes::new(), Bytes::from(vec![0xabu8; 256 * 1024])] {
            let msg = ProtoMsg::transfer(u64::MAX, u64::MAX, payload.clone());
            if let ProtoMsg::Transfer { data, .. } = round_trip(msg) {
                assert_eq!(data, payload);
            } else {
                panic!("Expected Transfer message");
            }
        }
    }

    #[test]
    fn test_remote_connected_round_trip() {
        let conn = RemoteConnection::new("198.51.100.4:61234".parse().unwrap());
        let msg = ProtoMsg::remote_connected(1, 2, &conn);
        if let ProtoMsg::RemoteConnected {
            tunnel_id,
            session_id,
            data,
        } = round_trip(msg)
        {
            assert_eq!((tunnel_id, session_id), (1, 2));
            assert_eq!(RemoteConnection::from_bytes(&data).unwrap(), conn);
        } else {
            panic!("Expected RemoteConnected message");
        }
    }

    #[test]
    fn test_remote_disconnect_round_trip() {
        let conn = RemoteConnection::new("198.51.100.4:61234".parse().unwrap());
        let msg = ProtoMsg::remote_disconnect(1, 2, &conn);
        if let ProtoMsg::RemoteDisconnect { data, .. } = round_trip(msg) {
            assert_eq!(RemoteConnection::from_bytes(&data).unwrap(), conn);
        } else {
            panic!("Expected RemoteDisconnect message");
        }
    }

    #[test]
    fn test_local_disconnect_round_trip() {
        let msg = ProtoMsg::LocalDisconnect {
            tunnel_id: 9,
            session_id: 11,
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_force_off_round_trip() {
        assert_eq!(round_trip(ProtoMsg::ForceOff), ProtoMsg::ForceOff);
        assert_eq!(round_trip(ProtoMsg::ForceOffReply), ProtoMsg::ForceOffReply);
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let body = Bytes::from_static(&[0x7f, 1, 2, 3]);
        assert!(ProtoMsg::decode(body).unwrap().is_none());
    }

    #[test]
    fn test_truncated_fields_rejected() {
        // Transfer needs 16 bytes of ids after the tag
        let body = Bytes::from_static(&[0x30, 0, 0, 0, 1]);
        assert!(matches!(
            ProtoMsg::decode(body),
            Err(ProtocolError::Truncated("Transfer"))
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(ProtoMsg::decode(Bytes::new()).is_err());
    }
}
