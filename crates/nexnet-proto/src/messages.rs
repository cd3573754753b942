//! Control message payloads
//!
//! Handshake, invocation envelopes and disconnect notices are bincode
//! encoded into frame payloads. Application arguments and results travel as
//! opaque bytes inside the invocation envelopes.

use crate::codec::ProtocolError;
use crate::{MethodId, PipeId};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Which side of the connection a peer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The connecting side (client)
    Initiator,
    /// The accepting side (server)
    Acceptor,
}

impl Role {
    pub fn opposite(&self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }
}

/// First frame sent by both peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    /// Hash of the method signature set both peers must agree on
    pub method_hash: u64,
    pub role: Role,
    pub max_frame_size: u32,
    pub initial_pipe_credit: u32,
    /// Optional credential presented by the initiator
    pub auth_token: Option<String>,
}

/// Invocation-Request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub method_id: MethodId,
    /// Pipes opened by the caller and passed as arguments
    pub pipe_ids: Vec<PipeId>,
    pub arguments: Vec<u8>,
}

/// Classification of a failed remote invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The handler returned an error
    HandlerFailed,
    /// The handler panicked
    HandlerPanicked,
    /// Arguments could not be decoded; the handler was not run
    InvalidArguments,
    MethodNotFound,
    Unauthorized,
    Cancelled,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteErrorKind::HandlerFailed => "handler failed",
            RemoteErrorKind::HandlerPanicked => "handler panicked",
            RemoteErrorKind::InvalidArguments => "invalid arguments",
            RemoteErrorKind::MethodNotFound => "method not found",
            RemoteErrorKind::Unauthorized => "unauthorized",
            RemoteErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Invocation-Response payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationResult {
    Value(Vec<u8>),
    Void,
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Graceful,
    ProtocolError,
    MethodHashMismatch,
    VersionMismatch,
    Authentication,
    Timeout,
    ServerShutdown,
    TransportError,
}

impl DisconnectReason {
    /// Reasons after which a client may establish a new session
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Timeout
                | DisconnectReason::TransportError
                | DisconnectReason::ServerShutdown
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Disconnect payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub message: Option<String>,
}

/// Encode a control message into a frame payload
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

/// Decode a control message from a frame payload
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(payload)?)
}
