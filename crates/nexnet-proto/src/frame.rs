//! Frame layout for the nexus wire protocol
//!
//! ```text
//! [frame_type: u8][id: u32][length: u32][flags: u8][payload: length bytes]
//! ```
//!
//! All integers are big-endian. The `id` is an invocation id for invocation
//! frames, a pipe id for pipe frames, a ping sequence for ping/pong, and zero
//! for handshake and disconnect frames.

use crate::{InvocationId, PipeId};
use bytes::{BufMut, Bytes};

/// Frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0,
    Ping = 1,
    Pong = 2,
    InvocationRequest = 3,
    InvocationResponse = 4,
    InvocationCancel = 5,
    PipeOpen = 6,
    PipeData = 7,
    PipeCredit = 8,
    PipeClose = 9,
    Disconnect = 10,
}

impl FrameType {
    /// Parse a wire tag, `None` for tags this version does not know
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Handshake),
            1 => Some(FrameType::Ping),
            2 => Some(FrameType::Pong),
            3 => Some(FrameType::InvocationRequest),
            4 => Some(FrameType::InvocationResponse),
            5 => Some(FrameType::InvocationCancel),
            6 => Some(FrameType::PipeOpen),
            7 => Some(FrameType::PipeData),
            8 => Some(FrameType::PipeCredit),
            9 => Some(FrameType::PipeClose),
            10 => Some(FrameType::Disconnect),
            _ => None,
        }
    }

    /// True for frames routed to the pipe manager
    pub fn is_pipe_frame(&self) -> bool {
        matches!(
            self,
            FrameType::PipeOpen | FrameType::PipeData | FrameType::PipeCredit | FrameType::PipeClose
        )
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Sender has completed its write half of the pipe
    pub const FIN: u8 = 0b0000_0001;
    /// Acknowledges a Pipe-Open
    pub const ACK: u8 = 0b0000_0010;
    /// Pipe aborted or rejected
    pub const RST: u8 = 0b0000_0100;
    /// Invocation request that expects no response
    pub const ONEWAY: u8 = 0b0000_1000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn with_oneway(mut self) -> Self {
        self.0 |= Self::ONEWAY;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn has_oneway(&self) -> bool {
        self.0 & Self::ONEWAY != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub id: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: frame_type (1) + id (4) + length (4) + flags (1) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(frame_type: FrameType, id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            id,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn handshake(payload: Bytes) -> Self {
        Self::new(FrameType::Handshake, 0, payload)
    }

    pub fn ping(sequence: u32) -> Self {
        Self::new(FrameType::Ping, sequence, Bytes::new())
    }

    pub fn pong(sequence: u32) -> Self {
        Self::new(FrameType::Pong, sequence, Bytes::new())
    }

    pub fn invocation_request(id: InvocationId, payload: Bytes, oneway: bool) -> Self {
        let frame = Self::new(FrameType::InvocationRequest, id, payload);
        if oneway {
            frame.with_flags(FrameFlags::new().with_oneway())
        } else {
            frame
        }
    }

    pub fn invocation_response(id: InvocationId, payload: Bytes) -> Self {
        Self::new(FrameType::InvocationResponse, id, payload)
    }

    pub fn invocation_cancel(id: InvocationId) -> Self {
        Self::new(FrameType::InvocationCancel, id, Bytes::new())
    }

    pub fn pipe_open(pipe_id: PipeId) -> Self {
        Self::new(FrameType::PipeOpen, pipe_id, Bytes::new())
    }

    pub fn pipe_open_ack(pipe_id: PipeId) -> Self {
        Self::new(FrameType::PipeOpen, pipe_id, Bytes::new()).with_flags(FrameFlags::new().with_ack())
    }

    pub fn pipe_data(pipe_id: PipeId, data: Bytes) -> Self {
        Self::new(FrameType::PipeData, pipe_id, data)
    }

    pub fn pipe_credit(pipe_id: PipeId, amount: u32) -> Self {
        let mut payload = bytes::BytesMut::with_capacity(4);
        payload.put_u32(amount);
        Self::new(FrameType::PipeCredit, pipe_id, payload.freeze())
    }

    /// Half-close: the sender will write no more data on this pipe
    pub fn pipe_fin(pipe_id: PipeId) -> Self {
        Self::new(FrameType::PipeClose, pipe_id, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Abort or reject a pipe in both directions
    pub fn pipe_reset(pipe_id: PipeId) -> Self {
        Self::new(FrameType::PipeClose, pipe_id, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn disconnect(payload: Bytes) -> Self {
        Self::new(FrameType::Disconnect, 0, payload)
    }

    /// Size of the frame on the wire
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Credit amount carried by a Pipe-Credit frame
    pub fn credit_amount(&self) -> Option<u32> {
        if self.frame_type != FrameType::PipeCredit || self.payload.len() != 4 {
            return None;
        }
        let p = &self.payload;
        Some(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_tags() {
        for tag in 0u8..=10 {
            let frame_type = FrameType::from_u8(tag).unwrap();
            assert_eq!(frame_type as u8, tag);
        }
        assert_eq!(FrameType::from_u8(11), None);
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new().with_fin().with_rst();
        assert!(flags.has_fin());
        assert!(flags.has_rst());
        assert!(!flags.has_ack());
        assert!(!flags.has_oneway());
        assert_eq!(FrameFlags::from_u8(flags.as_u8()), flags);
    }

    #[test]
    fn test_pipe_frames() {
        let ack = Frame::pipe_open_ack(5);
        assert_eq!(ack.frame_type, FrameType::PipeOpen);
        assert!(ack.flags.has_ack());

        let fin = Frame::pipe_fin(5);
        assert!(fin.flags.has_fin());
        assert!(fin.frame_type.is_pipe_frame());

        let credit = Frame::pipe_credit(5, 4096);
        assert_eq!(credit.credit_amount(), Some(4096));
        assert_eq!(Frame::pipe_data(5, Bytes::new()).credit_amount(), None);
    }

    #[test]
    fn test_oneway_request() {
        let frame = Frame::invocation_request(3, Bytes::from_static(b"args"), true);
        assert!(frame.flags.has_oneway());
        assert_eq!(frame.encoded_len(), Frame::HEADER_SIZE + 4);

        let frame = Frame::invocation_request(4, Bytes::new(), false);
        assert!(!frame.flags.has_oneway());
    }
}
