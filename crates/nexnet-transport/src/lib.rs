//! Transport abstraction layer for nexus sessions
//!
//! A session only needs a raw duplex byte stream. This crate defines the
//! transport-agnostic traits the session consumes, plus two implementations:
//! plain TCP and an in-memory duplex used by tests and embedders.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            nexnet-session                │
//! │  (frame codec, pipes, invocations)       │
//! └─────────────────────────────────────────┘
//!                     │ Connector / Listener
//!                     ↓
//! ┌──────────────┬──────────────┬───────────┐
//! │ TCP          │ in-memory    │ TLS, QUIC │
//! │ (stream.rs)  │ (memory.rs)  │ WebSocket │
//! └──────────────┴──────────────┴───────────┘
//! ```
//!
//! Any `AsyncRead + AsyncWrite` stream (a TLS stream, an upgraded HTTP
//! connection, a QUIC bidirectional stream) can be carried by
//! [`StreamTransport`].

pub mod memory;
pub mod stream;

pub use memory::{memory_listener, memory_pair, MemoryConnector, MemoryListener};
pub use stream::{StreamTransport, TcpConnector, TcpTransportListener};

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection reset by peer")]
    Reset,

    #[error("Connection aborted")]
    Aborted,

    #[error("Timeout")]
    Timeout,

    #[error("Transport closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Coarse failure classes used by the session to classify disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Refused,
    Reset,
    Aborted,
    Timeout,
    Closed,
    Other,
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Refused(_) => ErrorCategory::Refused,
            TransportError::Reset => ErrorCategory::Reset,
            TransportError::Aborted => ErrorCategory::Aborted,
            TransportError::Timeout => ErrorCategory::Timeout,
            TransportError::Closed => ErrorCategory::Closed,
            TransportError::Io(_) | TransportError::Configuration(_) => ErrorCategory::Other,
        }
    }

    /// Whether establishing a new connection could succeed later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Configuration(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => TransportError::Refused(e.to_string()),
            ErrorKind::ConnectionReset => TransportError::Reset,
            ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => TransportError::Aborted,
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::UnexpectedEof | ErrorKind::NotConnected => TransportError::Closed,
            _ => TransportError::Io(e),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Read half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established raw duplex byte stream
///
/// The session splits the transport once: the read half is owned by the
/// receive loop, the write half sits behind the session write lock.
pub trait Transport: Send + Debug {
    /// Split into independently usable read and write halves
    fn into_split(self: Box<Self>) -> (BoxedReader, BoxedWriter);

    /// Human-readable peer description for logging
    fn peer(&self) -> String;
}

/// Client-side: establishes outgoing transports
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self) -> TransportResult<Box<dyn Transport>>;
}

/// Server-side: accepts incoming transports
#[async_trait]
pub trait Listener: Send + Sync + Debug {
    /// Accept the next transport; `Closed` once the listener has shut down
    async fn accept(&self) -> TransportResult<Box<dyn Transport>>;

    /// Local endpoint description for logging
    fn local_description(&self) -> String;

    /// Stop accepting new transports
    async fn close(&self);
}

/// Close the write half of a transport
///
/// With `linger` the buffered bytes are flushed and the write side is shut
/// down cleanly; without it the half is simply dropped.
pub async fn close_writer(mut writer: BoxedWriter, linger: bool) -> TransportResult<()> {
    if linger {
        writer.flush().await?;
        writer.shutdown().await?;
    }
    drop(writer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_error_classification() {
        let cases = [
            (ErrorKind::ConnectionRefused, ErrorCategory::Refused),
            (ErrorKind::ConnectionReset, ErrorCategory::Reset),
            (ErrorKind::ConnectionAborted, ErrorCategory::Aborted),
            (ErrorKind::BrokenPipe, ErrorCategory::Aborted),
            (ErrorKind::TimedOut, ErrorCategory::Timeout),
            (ErrorKind::UnexpectedEof, ErrorCategory::Closed),
            (ErrorKind::InvalidData, ErrorCategory::Other),
        ];

        for (kind, category) in cases {
            let err = TransportError::from(Error::new(kind, "test"));
            assert_eq!(err.category(), category, "kind {:?}", kind);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::Reset.is_retryable());
        assert!(TransportError::Refused("nope".to_string()).is_retryable());
        assert!(!TransportError::Configuration("bad".to_string()).is_retryable());
    }
}
