//! Frame codec for the session byte stream
//!
//! `FrameCodec` plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.
//! Decoding is incremental: a partial header or payload leaves the buffer
//! untouched until more bytes arrive. Incoming payloads are copied into
//! segments rented from a [`BufferPool`].

use crate::buffer_pool::BufferPool;
use crate::frame::{Frame, FrameFlags, FrameType};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Protocol errors, fatal to the session
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unexpected frame: {0:?}")]
    UnexpectedFrame(FrameType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Encoder/decoder for nexus frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    strict: bool,
    pool: BufferPool,
}

impl FrameCodec {
    /// Codec using the shared pool and the default maximum frame size
    pub fn new() -> Self {
        Self::with_pool(BufferPool::shared())
    }

    pub fn with_pool(pool: BufferPool) -> Self {
        Self {
            max_frame_size: crate::DEFAULT_MAX_FRAME_SIZE as usize,
            strict: true,
            pool,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Strict codecs reject unknown frame types, lenient ones skip them
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Apply the max frame size negotiated during the handshake
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if src.len() < Frame::HEADER_SIZE {
                return Ok(None);
            }

            let tag = src[0];
            let id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
            let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
            let flags = FrameFlags::from_u8(src[9]);

            if length > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    len: length,
                    max: self.max_frame_size,
                });
            }

            let frame_type = match FrameType::from_u8(tag) {
                Some(frame_type) => frame_type,
                None if self.strict => return Err(ProtocolError::UnknownFrameType(tag)),
                None => {
                    if src.len() < Frame::HEADER_SIZE + length {
                        src.reserve(Frame::HEADER_SIZE + length - src.len());
                        return Ok(None);
                    }
                    warn!(tag, id, length, "Skipping frame with unknown type");
                    src.advance(Frame::HEADER_SIZE + length);
                    continue;
                }
            };

            if src.len() < Frame::HEADER_SIZE + length {
                src.reserve(Frame::HEADER_SIZE + length - src.len());
                return Ok(None);
            }

            src.advance(Frame::HEADER_SIZE);
            let payload = self.pool.copy_to_bytes(&src[..length]);
            src.advance(length);

            trace!(?frame_type, id, length, "Decoded frame");

            return Ok(Some(Frame {
                frame_type,
                id,
                flags,
                payload,
            }));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = frame.payload.len();
        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u32(frame.id);
        dst.put_u32(payload_len as u32);
        dst.put_u8(frame.flags.as_u8());
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode(codec: &mut FrameCodec, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let mut codec = FrameCodec::with_pool(BufferPool::with_config(64, 4));
        let frame = Frame::pipe_data(0x0102_0304, Bytes::from_static(b"abc"))
            .with_flags(FrameFlags::new().with_fin());
        let buf = encode(&mut codec, frame);

        assert_eq!(
            &buf[..Frame::HEADER_SIZE],
            &[7, 0x01, 0x02, 0x03, 0x04, 0, 0, 0, 3, FrameFlags::FIN]
        );
        assert_eq!(&buf[Frame::HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_decode_incomplete() {
        let mut codec = FrameCodec::with_pool(BufferPool::with_config(64, 4));
        let encoded = encode(&mut codec, Frame::invocation_response(9, Bytes::from_static(b"result")));

        let mut buf = BytesMut::from(&encoded[..4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[4..12]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[12..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::InvocationResponse);
        assert_eq!(frame.id, 9);
        assert_eq!(&frame.payload[..], b"result");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_in_order() {
        let mut codec = FrameCodec::with_pool(BufferPool::with_config(64, 4));
        let mut buf = BytesMut::new();
        for i in 0..5u8 {
            buf.extend_from_slice(&encode(&mut codec, Frame::pipe_data(1, Bytes::from(vec![i; 3]))));
        }

        for i in 0..5u8 {
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&frame.payload[..], &[i; 3]);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_protocol_error() {
        let mut codec = FrameCodec::with_pool(BufferPool::with_config(64, 4)).with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::PipeData as u8);
        buf.put_u32(1);
        buf.put_u32(17);
        buf.put_u8(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { len: 17, max: 16 }));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_pool(BufferPool::with_config(64, 4)).with_max_frame_size(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::pipe_data(1, Bytes::from_static(b"too long")), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_type_strict_and_lenient() {
        let mut raw = BytesMut::new();
        raw.put_u8(42);
        raw.put_u32(0);
        raw.put_u32(2);
        raw.put_u8(0);
        raw.extend_from_slice(b"zz");

        let mut strict = FrameCodec::with_pool(BufferPool::with_config(64, 4));
        let mut buf = raw.clone();
        assert!(matches!(
            strict.decode(&mut buf),
            Err(ProtocolError::UnknownFrameType(42))
        ));

        let mut lenient = FrameCodec::with_pool(BufferPool::with_config(64, 4)).with_strict(false);
        let mut buf = raw.clone();
        buf.extend_from_slice(&encode(&mut lenient, Frame::ping(3)));
        let frame = lenient.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.id, 3);
    }

    #[test]
    fn test_payload_backed_by_pool() {
        let pool = BufferPool::with_config(64, 4);
        let mut codec = FrameCodec::with_pool(pool.clone());
        let mut buf = encode(&mut codec, Frame::pipe_data(2, Bytes::from_static(b"pooled")));

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        drop(frame);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_framed_stream_over_duplex() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::{FramedRead, FramedWrite};

        let (a, b) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(a, FrameCodec::new());
        let mut reader = FramedRead::new(b, FrameCodec::new());

        let send = tokio::spawn(async move {
            for i in 0..10u32 {
                writer
                    .send(Frame::pipe_data(1, Bytes::from(i.to_be_bytes().to_vec())))
                    .await
                    .unwrap();
            }
        });

        for i in 0..10u32 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(&frame.payload[..], &i.to_be_bytes());
        }
        send.await.unwrap();
        assert!(reader.next().await.is_none());
    }
}
