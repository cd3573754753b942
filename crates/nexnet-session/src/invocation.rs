//! Invocation dispatcher
//!
//! Outbound: assigns invocation ids, tracks callers awaiting a response and
//! resolves each exactly once (response, cancellation or connection loss).
//! Inbound: looks up the handler, runs it on its own task with a
//! cancellation token, and always completes the pipes it was handed.

use crate::dispatch::{ConnectionIdentity, InvocationContext, MethodTable};
use crate::error::{InvokeError, SessionError};
use crate::pipe::PipeShared;
use crate::pipe_manager::PipeManager;
use crate::session::Session;
use crate::sink::FrameSink;
use crate::stats::SessionStats;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use nexnet_proto::{
    decode_message, encode_message, Frame, InvocationId, InvocationRequest, InvocationResult,
    MethodId, PipeId, ProtocolError, RemoteErrorKind,
};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type InvokeOutcome = Result<Option<Bytes>, InvokeError>;

/// Outbound invocations awaiting a response
#[derive(Default)]
pub(crate) struct PendingInvocations {
    /// Maps invocation_id -> oneshot sender for the outcome
    waiters: DashMap<InvocationId, oneshot::Sender<InvokeOutcome>>,
}

impl PendingInvocations {
    /// Register a new pending invocation
    /// Returns a receiver that will receive the outcome
    pub(crate) fn register(&self, id: InvocationId) -> oneshot::Receiver<InvokeOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        trace!(invocation_id = id, "Registered pending invocation");
        rx
    }

    /// Deliver the outcome for a pending invocation
    /// Returns false if the invocation was not pending (cancelled, or never sent)
    pub(crate) fn respond(&self, id: InvocationId, outcome: InvokeOutcome) -> bool {
        if let Some((_, tx)) = self.waiters.remove(&id) {
            if tx.send(outcome).is_err() {
                debug!(invocation_id = id, "Caller stopped waiting for response");
            }
            return true;
        }
        false
    }

    /// Forget a pending invocation; true if it was still pending
    pub(crate) fn cancel(&self, id: InvocationId) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Resolve every pending invocation with `ConnectionAborted`
    pub(crate) fn fail_all(&self) -> usize {
        let ids: Vec<InvocationId> = self.waiters.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.respond(id, Err(InvokeError::ConnectionAborted)) {
                failed += 1;
            }
        }
        failed
    }

    pub(crate) fn count(&self) -> usize {
        self.waiters.len()
    }
}

/// Removes the pending entry if the caller's future is dropped early
struct PendingGuard<'a> {
    pending: &'a PendingInvocations,
    id: InvocationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}

pub(crate) struct InvocationDispatcher {
    sink: Arc<FrameSink>,
    pipes: Arc<PipeManager>,
    methods: Arc<MethodTable>,
    identity: Arc<ConnectionIdentity>,
    session: Weak<Session>,
    next_id: AtomicU32,
    pending: PendingInvocations,
    /// Cancellation tokens of handlers currently running
    inbound: DashMap<InvocationId, CancellationToken>,
    max_pending: usize,
    closed: AtomicBool,
    /// Parent of every inbound handler token
    shutdown: CancellationToken,
    stats: Arc<SessionStats>,
}

impl InvocationDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sink: Arc<FrameSink>,
        pipes: Arc<PipeManager>,
        methods: Arc<MethodTable>,
        identity: Arc<ConnectionIdentity>,
        session: Weak<Session>,
        max_pending: usize,
        shutdown: CancellationToken,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            sink,
            pipes,
            methods,
            identity,
            session,
            next_id: AtomicU32::new(1),
            pending: PendingInvocations::default(),
            inbound: DashMap::new(),
            max_pending,
            closed: AtomicBool::new(false),
            shutdown,
            stats,
        }
    }

    fn allocate_id(&self) -> InvocationId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn encode_request(
        method_id: MethodId,
        arguments: Bytes,
        pipe_ids: Vec<PipeId>,
    ) -> Result<Bytes, InvokeError> {
        encode_message(&InvocationRequest {
            method_id,
            pipe_ids,
            arguments: arguments.to_vec(),
        })
        .map_err(|e| InvokeError::Codec(e.to_string()))
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub(crate) fn running_count(&self) -> usize {
        self.inbound.len()
    }

    /// Send a request and wait for its outcome
    ///
    /// When `cancel` fires first, the peer is told to cancel, the caller gets
    /// `Cancelled`, and a late response is discarded.
    pub(crate) async fn invoke(
        &self,
        method_id: MethodId,
        arguments: Bytes,
        pipe_ids: Vec<PipeId>,
        cancel: Option<&CancellationToken>,
    ) -> InvokeOutcome {
        if self.closed.load(Ordering::Acquire) {
            return Err(InvokeError::ConnectionAborted);
        }
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(InvokeError::Cancelled);
        }
        if self.pending.count() >= self.max_pending {
            return Err(InvokeError::TooManyInvocations {
                limit: self.max_pending,
            });
        }

        let payload = Self::encode_request(method_id, arguments, pipe_ids)?;
        let id = self.allocate_id();
        let mut rx = self.pending.register(id);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // fail_all may have run between the closed check and the registration
        if self.closed.load(Ordering::Acquire) {
            return Err(InvokeError::ConnectionAborted);
        }

        self.sink
            .send(Frame::invocation_request(id, payload, false))
            .await
            .map_err(send_error)?;
        self.stats.record_invocation_sent();
        trace!(invocation_id = id, method_id, "Invocation sent");

        let received = match cancel {
            None => rx.await,
            Some(token) => tokio::select! {
                biased;
                received = &mut rx => received,
                _ = token.cancelled() => {
                    if self.pending.cancel(id) {
                        debug!(invocation_id = id, "Invocation cancelled by caller");
                        self.sink.enqueue(Frame::invocation_cancel(id));
                        return Err(InvokeError::Cancelled);
                    }
                    // The outcome was delivered just before the cancel
                    rx.await
                }
            },
        };

        received.unwrap_or(Err(InvokeError::ConnectionAborted))
    }

    /// Send a request that expects no response
    pub(crate) async fn invoke_oneway(
        &self,
        method_id: MethodId,
        arguments: Bytes,
        pipe_ids: Vec<PipeId>,
    ) -> Result<(), InvokeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(InvokeError::ConnectionAborted);
        }

        let payload = Self::encode_request(method_id, arguments, pipe_ids)?;
        let id = self.allocate_id();
        self.sink
            .send(Frame::invocation_request(id, payload, true))
            .await
            .map_err(send_error)?;
        self.stats.record_invocation_sent();
        trace!(invocation_id = id, method_id, "One-way invocation sent");
        Ok(())
    }

    /// Route an Invocation-Response to its caller
    pub(crate) fn complete(&self, id: InvocationId, payload: &[u8]) -> Result<(), ProtocolError> {
        let result: InvocationResult = decode_message(payload)?;
        let outcome = match result {
            InvocationResult::Value(value) => Ok(Some(Bytes::from(value))),
            InvocationResult::Void => Ok(None),
            InvocationResult::Error { kind, message } => Err(InvokeError::Remote { kind, message }),
        };

        if !self.pending.respond(id, outcome) {
            debug!(invocation_id = id, "Discarding response for invocation no longer pending");
        }
        Ok(())
    }

    /// Reply from the receive loop without waiting on the transport
    fn reject(&self, id: InvocationId, oneway: bool, kind: RemoteErrorKind, message: String) {
        if oneway {
            return;
        }
        match encode_message(&InvocationResult::Error { kind, message }) {
            Ok(payload) => self.sink.enqueue(Frame::invocation_response(id, payload)),
            Err(e) => error!(invocation_id = id, "Failed to encode error response: {}", e),
        }
    }

    /// Handle an Invocation-Request from the peer
    pub(crate) fn handle_request(self: &Arc<Self>, frame: Frame) {
        let id = frame.id;
        let oneway = frame.flags.has_oneway();
        self.stats.record_invocation_received();

        let request: InvocationRequest = match decode_message(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(invocation_id = id, "Malformed invocation request: {}", e);
                self.reject(id, oneway, RemoteErrorKind::InvalidArguments, e.to_string());
                return;
            }
        };
        let method_id = request.method_id;

        // Claim the pipes first so they are completed whatever happens next
        let mut pipes = Vec::with_capacity(request.pipe_ids.len());
        for pipe_id in &request.pipe_ids {
            match self.pipes.take_incoming(*pipe_id) {
                Some(pipe) => pipes.push(pipe),
                None => {
                    warn!(invocation_id = id, pipe_id, "Invocation names an unknown pipe");
                    pipes.iter().for_each(|pipe| pipe.reset());
                    self.reject(
                        id,
                        oneway,
                        RemoteErrorKind::InvalidArguments,
                        format!("unknown pipe {}", pipe_id),
                    );
                    return;
                }
            }
        }

        let Some(handler) = self.methods.get(method_id) else {
            debug!(invocation_id = id, method_id, "No handler for method");
            pipes.iter().for_each(|pipe| pipe.reset());
            self.reject(
                id,
                oneway,
                RemoteErrorKind::MethodNotFound,
                format!("method {} not found", method_id),
            );
            return;
        };

        if !self.methods.authorize(method_id, &self.identity) {
            warn!(
                invocation_id = id,
                method_id,
                principal = ?self.identity.principal,
                "Invocation not authorized"
            );
            pipes.iter().for_each(|pipe| pipe.reset());
            self.reject(
                id,
                oneway,
                RemoteErrorKind::Unauthorized,
                format!("not authorized to call method {}", method_id),
            );
            return;
        }

        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let token = self.shutdown.child_token();
        match self.inbound.entry(id) {
            Entry::Occupied(_) => {
                warn!(invocation_id = id, method_id, "Peer reused a running invocation id");
                pipes.iter().for_each(|pipe| pipe.reset());
                self.reject(
                    id,
                    oneway,
                    RemoteErrorKind::HandlerFailed,
                    format!("invocation {} is already running", id),
                );
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let finishers: Vec<Arc<PipeShared>> = pipes.iter().map(|pipe| pipe.shared()).collect();
        let ctx = InvocationContext::new(
            id,
            method_id,
            Bytes::from(request.arguments),
            pipes,
            token,
            self.identity.clone(),
            self.session.clone(),
        );

        let this = self.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.call(ctx)).catch_unwind().await;

            for pipe in &finishers {
                pipe.finish().await;
            }
            this.inbound.remove(&id);

            let response = match result {
                Ok(Ok(Some(value))) => InvocationResult::Value(value.to_vec()),
                Ok(Ok(None)) => InvocationResult::Void,
                Ok(Err(e)) => {
                    debug!(invocation_id = id, method_id, "Handler failed: {}", e);
                    InvocationResult::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(invocation_id = id, method_id, "Handler panicked: {}", message);
                    InvocationResult::Error {
                        kind: RemoteErrorKind::HandlerPanicked,
                        message,
                    }
                }
            };

            if oneway {
                return;
            }
            this.respond(id, response).await;
        });
    }

    async fn respond(&self, id: InvocationId, response: InvocationResult) {
        let payload = match encode_message(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(invocation_id = id, "Failed to encode response: {}", e);
                return;
            }
        };

        match self.sink.send(Frame::invocation_response(id, payload)).await {
            Ok(()) => {}
            Err(SessionError::Protocol(ProtocolError::FrameTooLarge { len, max })) => {
                warn!(invocation_id = id, len, max, "Response exceeds the negotiated frame size");
                self.reject(
                    id,
                    false,
                    RemoteErrorKind::HandlerFailed,
                    format!("response of {} bytes exceeds the {} byte frame limit", len, max),
                );
            }
            Err(e) => debug!(invocation_id = id, "Could not send response: {}", e),
        }
    }

    /// Peer cancelled an invocation it sent us
    pub(crate) fn cancel_inbound(&self, id: InvocationId) {
        match self.inbound.remove(&id) {
            Some((_, token)) => {
                debug!(invocation_id = id, "Cancelling running handler");
                token.cancel();
            }
            None => trace!(invocation_id = id, "Cancel for invocation not running"),
        }
    }

    /// Session is gone: fail outbound callers and cancel inbound handlers
    pub(crate) fn abort_all(&self) {
        self.closed.store(true, Ordering::Release);

        let failed = self.pending.fail_all();
        for entry in self.inbound.iter() {
            entry.value().cancel();
        }
        self.inbound.clear();

        if failed > 0 {
            debug!(count = failed, "Aborted pending invocations");
        }
    }
}

fn send_error(error: SessionError) -> InvokeError {
    match error {
        SessionError::Protocol(e @ ProtocolError::FrameTooLarge { .. }) => {
            InvokeError::Codec(e.to_string())
        }
        _ => InvokeError::ConnectionAborted,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_respond() {
        let pending = PendingInvocations::default();
        let rx = pending.register(7);
        assert_eq!(pending.count(), 1);

        assert!(pending.respond(7, Ok(Some(Bytes::from_static(b"42")))));
        assert_eq!(pending.count(), 0);
        assert_eq!(rx.await.unwrap(), Ok(Some(Bytes::from_static(b"42"))));
    }

    #[tokio::test]
    async fn test_respond_exactly_once() {
        let pending = PendingInvocations::default();
        let rx = pending.register(1);

        assert!(pending.cancel(1));
        // A late response after cancellation finds nothing to complete
        assert!(!pending.respond(1, Ok(None)));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingInvocations::default();
        let receivers: Vec<_> = (3..=5).map(|id| pending.register(id)).collect();

        assert_eq!(pending.fail_all(), 3);
        assert_eq!(pending.count(), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(InvokeError::ConnectionAborted));
        }
    }

    #[test]
    fn test_guard_removes_entry() {
        let pending = PendingInvocations::default();
        let _rx = pending.register(9);
        {
            let _guard = PendingGuard {
                pending: &pending,
                id: 9,
            };
        }
        assert_eq!(pending.count(), 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
