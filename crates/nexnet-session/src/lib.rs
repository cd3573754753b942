//! Session runtime for nexus peers
//!
//! A [`Session`] multiplexes method invocations in both directions and any
//! number of flow-controlled [`NexusPipe`]s over one transport. Clients hold
//! a [`NexusClient`] that re-establishes lost sessions; servers run a
//! [`NexusServer`] that tracks live sessions in a [`ConnectionRegistry`].
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
mod invocation;
pub mod pipe;
mod pipe_manager;
pub mod reconnect;
pub mod registry;
pub mod server;
pub mod session;
mod sink;
pub mod stats;

pub use channel::{ChannelReader, ChannelWriter, NexusChannel};
pub use client::{ClientEvent, NexusClient};
pub use codec::{BincodeCodec, CodecError, JsonCodec, PayloadCodec};
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use dispatch::{
    handler_fn, method_hash, typed_handler, Authenticator, Authorizer, ConnectionIdentity,
    FnHandler, HandlerError, InvocationContext, MethodHandler, MethodTable, TypedHandler,
};
pub use error::{ConfigError, InvokeError, PipeError, SessionError};
pub use pipe::{NexusPipe, PipeReader, PipeState, PipeWriter};
pub use reconnect::{
    DelaySequence, ExponentialBackoff, ReconnectError, ReconnectManager, ReconnectPolicy,
};
pub use registry::ConnectionRegistry;
pub use server::NexusServer;
pub use session::{ConnectionState, Negotiated, Session};
pub use stats::{SessionStats, SessionStatsSnapshot};
