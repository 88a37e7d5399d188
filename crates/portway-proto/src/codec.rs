//! Length-delimited wire codec
//!
//! Frame layout: `u32` big-endian body length, then the message body as
//! produced by [`ProtoMsg::encode`]. Frames with an unrecognized type tag
//! are consumed and skipped rather than treated as fatal.

use crate::{ProtoMsg, ProtocolError, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

const LEN_PREFIX: usize = 4;

/// Codec framing `ProtoMsg` values onto a byte stream.
#[derive(Debug, Default)]
pub struct ProtoCodec {
    _private: (),
}

impl ProtoCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ProtoCodec {
    type Item = ProtoMsg;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtoMsg>, ProtocolError> {
        loop {
            if src.len() < LEN_PREFIX {
                return Ok(None);
            }
            let mut len_bytes = [0u8; LEN_PREFIX];
            len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
            let len = u32::from_be_bytes(len_bytes) as usize;

            if len > MAX_FRAME_SIZE as usize {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            if src.len() < LEN_PREFIX + len {
                src.reserve(LEN_PREFIX + len - src.len());
                return Ok(None);
            }

            src.advance(LEN_PREFIX);
            let body = src.split_to(len).freeze();
            match ProtoMsg::decode(body)? {
                Some(msg) => return Ok(Some(msg)),
                // unknown tag, skip the frame and keep reading
                None => {
                    trace!("skipping frame with unknown type tag");
                    continue;
                }
            }
        }
    }
}

impl Encoder<ProtoMsg> for ProtoCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: ProtoMsg, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = msg.encode();
        if body.len() > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
