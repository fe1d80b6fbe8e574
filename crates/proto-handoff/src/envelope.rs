//! The outer bus frame: `{length:u32, routing_key_len:u16, routing_key, body}`.
//!
//! `length` covers everything that follows it (`routing_key_len` through the
//! end of `body`), matching spec.md §6. `routing_key` identifies which
//! message type and destination the frame carries; the body bytes are
//! whatever a specific message's `encode`/`decode` produces.

use crate::codec::{self, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_key: String,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    pub fn encode_to(&self, out: &mut BytesMut) {
        let routing_key_bytes = self.routing_key.as_bytes();
        let length = 2 + routing_key_bytes.len() + self.body.len();
        out.put_u32(length as u32);
        codec::put_str(out, &self.routing_key);
        out.put_slice(&self.body);
    }

    pub fn encoded(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_to(&mut out);
        out.freeze()
    }

    /// Decode a single complete frame (no outer `length` prefix consumed by
    /// the caller; this is the inverse of `encoded()`, including the
    /// length prefix).
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::UnexpectedEof {
                needed: 4 - buf.remaining(),
            });
        }
        let length = codec::get_u32(buf)? as usize;
        if buf.remaining() < length {
            return Err(Error::UnexpectedEof {
                needed: length - buf.remaining(),
            });
        }
        let mut body_buf = buf.copy_to_bytes(length);
        let routing_key = codec::get_str(&mut body_buf)?;
        Ok(Envelope {
            routing_key,
            body: body_buf,
        })
    }
}

/// `tokio_util::codec` adapter so a bus transport can be framed directly
/// over an `AsyncRead`/`AsyncWrite` stream, matching the pattern
/// `tokio-util`'s codec feature is pulled in for elsewhere in the stack.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(4 + length).freeze();
        Envelope::decode(&mut frame).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        item.encode_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let env = Envelope::new("handoff_server.request", Bytes::from_static(b"hello"));
        let mut encoded = env.encoded();
        let decoded = Envelope::decode(&mut encoded).unwrap();
        assert_eq!(decoded, env);
        assert!(!encoded.has_remaining());
    }

    #[test]
    fn codec_handles_partial_frames() {
        let env = Envelope::new("data_writer.peer-b.request", Bytes::from_static(b"payload"));
        let full = env.encoded();

        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
    }
}
