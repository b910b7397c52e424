//! Outbound WebSocket encoders.

use bytes::{BufMut, BytesMut};

use super::frame::{self, OpCode, WebSocketMessage};
use super::handshake::WebSocketVersion;
use crate::error::{Result, SockwireError};
use crate::protocol::PackageEncoder;

/// Split `payload` into frames of at most `max_frame_payload` bytes.
///
/// Control frames and a `max_frame_payload` of 0 always produce one frame.
fn encode_frames<M>(
    dst: &mut BytesMut,
    op_code: OpCode,
    payload: &[u8],
    max_frame_payload: usize,
    mut next_mask: M,
) -> usize
where
    M: FnMut() -> Option<[u8; 4]>,
{
    let start = dst.len();
    let chunk = if max_frame_payload == 0 || op_code.is_control() {
        payload.len().max(1)
    } else {
        max_frame_payload
    };

    let mut chunks = payload.chunks(chunk).peekable();
    if chunks.peek().is_none() {
        frame::write_header(dst, true, op_code, 0, next_mask());
        return dst.len() - start;
    }

    let mut first = true;
    while let Some(part) = chunks.next() {
        let fin = chunks.peek().is_none();
        let op = if first { op_code } else { OpCode::Continuation };
        first = false;

        let mask = next_mask();
        frame::write_header(dst, fin, op, part.len(), mask);
        let body = dst.len();
        dst.put_slice(part);
        if let Some(mask) = mask {
            frame::apply_mask(&mut dst[body..], mask);
        }
    }
    dst.len() - start
}

/// Server-to-client frames (unmasked).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketEncoder {
    max_frame_payload: usize,
}

impl WebSocketEncoder {
    /// `max_frame_payload` of 0 never fragments.
    pub fn new(max_frame_payload: usize) -> Self {
        Self { max_frame_payload }
    }
}

impl PackageEncoder<WebSocketMessage> for WebSocketEncoder {
    fn encode(&mut self, dst: &mut BytesMut, message: &WebSocketMessage) -> Result<usize> {
        Ok(encode_frames(
            dst,
            message.op_code,
            &message.data,
            self.max_frame_payload,
            || None,
        ))
    }
}

/// Client-to-server frames, each masked with a fresh random key.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketMaskedEncoder {
    max_frame_payload: usize,
}

impl WebSocketMaskedEncoder {
    pub fn new(max_frame_payload: usize) -> Self {
        Self { max_frame_payload }
    }
}

impl PackageEncoder<WebSocketMessage> for WebSocketMaskedEncoder {
    fn encode(&mut self, dst: &mut BytesMut, message: &WebSocketMessage) -> Result<usize> {
        Ok(encode_frames(
            dst,
            message.op_code,
            &message.data,
            self.max_frame_payload,
            || Some(rand::random::<u32>().to_be_bytes()),
        ))
    }
}

/// Draft-00 end-mark framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hybi00Encoder;

impl PackageEncoder<WebSocketMessage> for Hybi00Encoder {
    fn encode(&mut self, dst: &mut BytesMut, message: &WebSocketMessage) -> Result<usize> {
        match message.op_code {
            OpCode::Text => {
                if std::str::from_utf8(&message.data).is_err() {
                    return Err(SockwireError::protocol("text message is not valid UTF-8"));
                }
                dst.reserve(message.data.len() + 2);
                dst.put_u8(0x00);
                dst.put_slice(&message.data);
                dst.put_u8(0xFF);
                Ok(message.data.len() + 2)
            }
            OpCode::Close => {
                dst.put_slice(&[0xFF, 0x00]);
                Ok(2)
            }
            _ => Err(SockwireError::NotImplemented(
                "draft-00 supports only text and close frames",
            )),
        }
    }
}

/// Server-side encoder for a negotiated version.
#[derive(Debug, Clone, Copy)]
pub enum VersionedEncoder {
    Framed(WebSocketEncoder),
    Hybi00(Hybi00Encoder),
}

impl VersionedEncoder {
    pub fn for_version(version: WebSocketVersion, max_frame_payload: usize) -> Self {
        if version.is_framed() {
            Self::Framed(WebSocketEncoder::new(max_frame_payload))
        } else {
            Self::Hybi00(Hybi00Encoder)
        }
    }
}

impl PackageEncoder<WebSocketMessage> for VersionedEncoder {
    fn encode(&mut self, dst: &mut BytesMut, message: &WebSocketMessage) -> Result<usize> {
        match self {
            Self::Framed(encoder) => encoder.encode(dst, message),
            Self::Hybi00(encoder) => encoder.encode(dst, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::options::WebSocketOptions;
    use crate::protocol::PipelineBuffer;
    use crate::websocket::{WebSocketFilter, WebSocketPackage};

    const UPGRADE: &[u8] =
        b"GET / HTTP/1.1\r\nSec-WebSocket-Key: a2V5\r\nSec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_unmasked_single_frame() {
        let mut dst = BytesMut::new();
        let written = WebSocketEncoder::default()
            .encode(&mut dst, &WebSocketMessage::text("hello"))
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(&dst[..], b"\x81\x05hello");
    }

    #[test]
    fn test_empty_message_is_one_frame() {
        let mut dst = BytesMut::new();
        WebSocketEncoder::new(4)
            .encode(&mut dst, &WebSocketMessage::binary(Bytes::new()))
            .unwrap();
        assert_eq!(&dst[..], &[0x82, 0x00]);
    }

    #[test]
    fn test_fragmentation_layout() {
        let mut dst = BytesMut::new();
        WebSocketEncoder::new(4)
            .encode(&mut dst, &WebSocketMessage::text("abcdefghij"))
            .unwrap();
        assert_eq!(&dst[..], b"\x01\x04abcd\x00\x04efgh\x80\x02ij");
    }

    #[test]
    fn test_control_frames_never_fragment() {
        let mut dst = BytesMut::new();
        WebSocketEncoder::new(2)
            .encode(&mut dst, &WebSocketMessage::ping(&b"12345"[..]))
            .unwrap();
        assert_eq!(&dst[..], b"\x89\x0512345");
    }

    #[test]
    fn test_masked_fragments_decode() {
        let mut dst = BytesMut::new();
        dst.extend_from_slice(UPGRADE);
        let message = WebSocketMessage::binary(vec![9u8; 1000]);
        WebSocketMaskedEncoder::new(300)
            .encode(&mut dst, &message)
            .unwrap();
        assert_ne!(dst[UPGRADE.len() + 1] & frame::MASK_BIT, 0);

        let mut buffer = PipelineBuffer::from_chain(
            WebSocketFilter::chain(Arc::new(WebSocketOptions::default())),
            0,
        );
        let packages = buffer.push(dst.freeze()).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1], WebSocketPackage::Message(message));
    }

    #[test]
    fn test_hybi00_encoder() {
        let mut dst = BytesMut::new();
        let mut encoder = Hybi00Encoder;
        encoder.encode(&mut dst, &WebSocketMessage::text("hi")).unwrap();
        encoder
            .encode(&mut dst, &WebSocketMessage::close(1000, ""))
            .unwrap();
        assert_eq!(&dst[..], b"\x00hi\xff\xff\x00");

        let err = encoder
            .encode(&mut dst, &WebSocketMessage::binary(&b"x"[..]))
            .unwrap_err();
        assert!(matches!(err, SockwireError::NotImplemented(_)));
    }

    #[test]
    fn test_versioned_encoder() {
        let mut dst = BytesMut::new();
        VersionedEncoder::for_version(WebSocketVersion::Hybi00, 0)
            .encode(&mut dst, &WebSocketMessage::text("a"))
            .unwrap();
        VersionedEncoder::for_version(WebSocketVersion::Rfc6455, 0)
            .encode(&mut dst, &WebSocketMessage::text("a"))
            .unwrap();
        assert_eq!(&dst[..], b"\x00a\xff\x81\x01a");
    }
}
