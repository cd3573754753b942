//! nexnet: bidirectional RPC and pipe multiplexing over one connection
//!
//! Either peer of a connection can invoke methods on the other. Invocations
//! may carry flow-controlled pipes for streaming bytes or typed items in both
//! directions. The crate is a facade over three layers:
//!
//! - [`proto`]: frame format, codec and control messages
//! - [`transport`]: byte-stream transports (TCP, in-memory)
//! - [`session`]: sessions, pipes, channels, dispatch, client and server
//!
//! ```no_run
//! use nexnet::{handler_fn, ClientConfig, MethodTable, NexusClient, NexusServer, ServerConfig};
//! use nexnet::transport::memory_listener;
//!
//! # async fn run() -> Result<(), nexnet::SessionError> {
//! let (listener, connector) = memory_listener("demo");
//! let echo = MethodTable::new(1).with_handler(
//!     1,
//!     handler_fn(|ctx| async move { Ok(Some(ctx.arguments().clone())) }),
//! );
//! let _server = NexusServer::serve(listener, ServerConfig::default(), echo)?;
//!
//! let client = NexusClient::connect(connector, ClientConfig::default(), MethodTable::new(1)).await?;
//! let reply = client.invoke(1, &b"hello"[..]).await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub use nexnet_proto as proto;
pub use nexnet_session as session;
pub use nexnet_transport as transport;

pub use nexnet_proto::{
    BufferPool, DisconnectReason, MethodId, PipeId, RemoteErrorKind, Role, PROTOCOL_VERSION,
};
pub use nexnet_session::{
    handler_fn, method_hash, typed_handler, Authenticator, Authorizer, BincodeCodec,
    ChannelReader, ChannelWriter, ClientConfig, ClientEvent, ConnectionIdentity,
    ConnectionRegistry, ConnectionState, DelaySequence, ExponentialBackoff, HandlerError,
    InvocationContext, InvokeError, JsonCodec, MethodHandler, MethodTable, NexusChannel,
    NexusClient, NexusPipe, NexusServer, PayloadCodec, PipeError, PipeReader, PipeWriter,
    ReconnectPolicy, ServerConfig, Session, SessionConfig, SessionError,
};
pub use nexnet_transport::{Connector, Listener, Transport, TransportError};
