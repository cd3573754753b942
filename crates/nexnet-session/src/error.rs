//! Error types for sessions, pipes and invocations

use nexnet_proto::{DisconnectReason, ProtocolError, RemoteErrorKind};
use nexnet_transport::TransportError;
use thiserror::Error;

/// Errors surfaced to users of a single pipe
///
/// Pipe errors never tear down the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("Pipe closed")]
    Closed,

    #[error("Pipe reset by peer")]
    Reset,

    #[error("Pipe open rejected by peer")]
    Rejected,

    #[error("Too many pipes (limit {limit})")]
    TooManyPipes { limit: usize },

    #[error("Timed out waiting for pipe open acknowledgement")]
    OpenTimeout,

    #[error("Peer exceeded its flow-control credit")]
    CreditViolation,

    #[error("Pipe operation cancelled")]
    Cancelled,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Channel codec error: {0}")]
    Codec(String),
}

/// Outcome of a failed invocation as seen by the caller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Remote error ({kind}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Too many pending invocations (limit {limit})")]
    TooManyInvocations { limit: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Codec error: {0}")]
    Codec(String),
}

impl InvokeError {
    /// True when the failure came from the remote handler rather than the connection
    pub fn is_remote(&self) -> bool {
        matches!(self, InvokeError::Remote { .. })
    }
}

/// Session establishment and lifecycle errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Handshake rejected by peer: {reason}")]
    HandshakeRejected {
        reason: DisconnectReason,
        message: Option<String>,
    },

    #[error("Method hash mismatch: local {local:#x}, remote {remote:#x}")]
    MethodHashMismatch { local: u64, remote: u64 },

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether a reconnecting client should try again after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Transport(e) => e.is_retryable(),
            SessionError::HandshakeTimeout | SessionError::Closed => true,
            SessionError::HandshakeRejected { reason, .. } => reason.is_reconnectable(),
            SessionError::Protocol(ProtocolError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Invalid configuration values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
