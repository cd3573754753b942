//! Payload codecs for typed arguments, results and channel items
//!
//! The session treats application payloads as opaque bytes; these codecs
//! are the pluggable encoders used by the typed helpers.

use crate::error::{InvokeError, PipeError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Codec error: {0}")]
pub struct CodecError(pub String);

impl From<CodecError> for InvokeError {
    fn from(e: CodecError) -> Self {
        InvokeError::Codec(e.0)
    }
}

impl From<CodecError> for PipeError {
    fn from(e: CodecError) -> Self {
        PipeError::Codec(e.0)
    }
}

/// Encoder/decoder of typed values to and from byte spans
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError>;

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary encoding (bincode)
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

/// JSON encoding, handy when a peer is not written in Rust
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
    }
}
