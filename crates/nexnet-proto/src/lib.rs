//! Nexnet Protocol Definitions
//!
//! This crate defines the wire frame layout, the frame codec, the control
//! message payloads exchanged between two nexus peers, and the pooled buffer
//! segments that back incoming frame payloads.

pub mod buffer_pool;
pub mod codec;
pub mod frame;
pub mod messages;

pub use buffer_pool::{BufferPool, PoolStats, PooledSegment};
pub use codec::{FrameCodec, ProtocolError};
pub use frame::{Frame, FrameFlags, FrameType};
pub use messages::*;

/// Protocol version exchanged in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Default negotiated maximum frame payload (64KB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Hard upper bound a peer may propose for the maximum frame payload (16MB)
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16 * 1024 * 1024;

/// Default per-pipe flow-control window in bytes
pub const DEFAULT_PIPE_CREDIT: u32 = 256 * 1024;

/// Pipe id
pub type PipeId = u32;

/// Invocation id
pub type InvocationId = u32;

/// Method id as assigned by the generated dispatch table
pub type MethodId = u32;
