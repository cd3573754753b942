//! Method dispatch table, handler traits and the per-invocation context

use crate::channel::NexusChannel;
use crate::codec::PayloadCodec;
use crate::pipe::NexusPipe;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use nexnet_proto::{InvocationId, MethodId, RemoteErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Who is on the other end of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub session_id: Uuid,
    pub peer: String,
    /// Principal established by the server's authenticator, if any
    pub principal: Option<String>,
}

/// Error returned by a method handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }

    pub(crate) fn kind(&self) -> RemoteErrorKind {
        match self {
            HandlerError::Failed(_) => RemoteErrorKind::HandlerFailed,
            HandlerError::InvalidArguments(_) => RemoteErrorKind::InvalidArguments,
            HandlerError::Unauthorized(_) => RemoteErrorKind::Unauthorized,
            HandlerError::Cancelled => RemoteErrorKind::Cancelled,
        }
    }
}

/// Everything a handler gets for one inbound invocation
pub struct InvocationContext {
    invocation_id: InvocationId,
    method_id: MethodId,
    arguments: Bytes,
    pipes: Vec<Option<NexusPipe>>,
    cancellation: CancellationToken,
    identity: Arc<ConnectionIdentity>,
    session: Weak<Session>,
}

impl InvocationContext {
    pub(crate) fn new(
        invocation_id: InvocationId,
        method_id: MethodId,
        arguments: Bytes,
        pipes: Vec<NexusPipe>,
        cancellation: CancellationToken,
        identity: Arc<ConnectionIdentity>,
        session: Weak<Session>,
    ) -> Self {
        Self {
            invocation_id,
            method_id,
            arguments,
            pipes: pipes.into_iter().map(Some).collect(),
            cancellation,
            identity,
            session,
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    pub fn arguments(&self) -> &Bytes {
        &self.arguments
    }

    /// Number of pipes passed by the caller
    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    /// Take the pipe at `index` in argument order
    ///
    /// Pipes are completed automatically when the handler returns.
    pub fn take_pipe(&mut self, index: usize) -> Option<NexusPipe> {
        self.pipes.get_mut(index).and_then(Option::take)
    }

    /// Take the pipe at `index` as a typed channel
    pub fn take_channel<T, C>(&mut self, index: usize) -> Option<NexusChannel<T, C>>
    where
        T: Serialize + DeserializeOwned,
        C: PayloadCodec,
    {
        self.take_pipe(index).map(NexusChannel::new)
    }

    /// Cancelled when the caller cancels or the session goes away
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The session the invocation arrived on, for calling back into the peer
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}

/// Server-side implementation of one method
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Run the method; `Ok(None)` is a void result
    async fn call(&self, ctx: InvocationContext) -> Result<Option<Bytes>, HandlerError>;
}

/// Handler backed by an async closure over raw bytes
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Bytes>, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: InvocationContext) -> Result<Option<Bytes>, HandlerError> {
        (self.f)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Bytes>, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

/// Handler that decodes typed arguments and encodes a typed result
pub struct TypedHandler<A, R, C, F> {
    f: F,
    _marker: PhantomData<fn(A) -> (R, C)>,
}

#[async_trait]
impl<A, R, C, F, Fut> MethodHandler for TypedHandler<A, R, C, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    C: PayloadCodec,
    F: Fn(A, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: InvocationContext) -> Result<Option<Bytes>, HandlerError> {
        let arguments: A = C::decode(ctx.arguments())
            .map_err(|e| HandlerError::InvalidArguments(e.to_string()))?;
        let result = (self.f)(arguments, ctx).await?;
        C::encode(&result)
            .map(Some)
            .map_err(|e| HandlerError::Failed(format!("failed to encode result: {}", e)))
    }
}

/// Wrap a typed async function as a [`MethodHandler`]
///
/// Arguments that fail to decode produce an `InvalidArguments` error and
/// the function is never called.
pub fn typed_handler<A, R, C, F, Fut>(f: F) -> TypedHandler<A, R, C, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    C: PayloadCodec,
    F: Fn(A, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

/// Per-method access check for inbound invocations
#[cfg_attr(test, mockall::automock)]
pub trait Authorizer: Send + Sync {
    fn authorize(&self, method_id: MethodId, identity: &ConnectionIdentity) -> bool;
}

/// Validates the initiator's handshake token on the accepting side
///
/// Returns the authenticated principal, or a rejection message.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Result<Option<String>, String>;
}

impl<F> Authenticator for F
where
    F: Fn(Option<&str>) -> Result<Option<String>, String> + Send + Sync,
{
    fn authenticate(&self, token: Option<&str>) -> Result<Option<String>, String> {
        self(token)
    }
}

/// Hash of a method signature set, compared during the handshake
///
/// First eight bytes (big-endian) of a SHA-256 over the signatures, each
/// followed by a NUL separator, so both the signatures and their order matter.
pub fn method_hash<S: AsRef<str>>(signatures: &[S]) -> u64 {
    let mut hasher = Sha256::new();
    for signature in signatures {
        hasher.update(signature.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Method id to handler mapping shared by every session of a client or server
#[derive(Clone)]
pub struct MethodTable {
    method_hash: u64,
    handlers: HashMap<MethodId, Arc<dyn MethodHandler>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl MethodTable {
    pub fn new(method_hash: u64) -> Self {
        Self {
            method_hash,
            handlers: HashMap::new(),
            authorizer: None,
        }
    }

    pub fn with_handler(
        mut self,
        method_id: MethodId,
        handler: impl MethodHandler + 'static,
    ) -> Self {
        self.register(method_id, handler);
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    pub fn register(&mut self, method_id: MethodId, handler: impl MethodHandler + 'static) {
        self.handlers.insert(method_id, Arc::new(handler));
    }

    pub fn method_hash(&self) -> u64 {
        self.method_hash
    }

    pub fn get(&self, method_id: MethodId) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(&method_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Everyone is allowed when no authorizer is installed
    pub fn authorize(&self, method_id: MethodId, identity: &ConnectionIdentity) -> bool {
        match &self.authorizer {
            Some(authorizer) => authorizer.authorize(method_id, identity),
            None => true,
        }
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("MethodTable")
            .field("method_hash", &format_args!("{:#x}", self.method_hash))
            .field("methods", &ids)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}
