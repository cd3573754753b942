//! Session: one handshaken connection between two nexus peers
//!
//! A session owns the frame reader (driven by a single receive loop), the
//! serialized frame writer, the pipe manager and the invocation dispatcher.
//! Either peer may invoke methods on the other once the handshake is done.

use crate::channel::NexusChannel;
use crate::codec::PayloadCodec;
use crate::config::{SessionConfig, MIN_FRAME_SIZE};
use crate::dispatch::{Authenticator, ConnectionIdentity, MethodTable};
use crate::error::{InvokeError, PipeError, SessionError};
use crate::invocation::InvocationDispatcher;
use crate::pipe::{NexusPipe, PipeParams};
use crate::pipe_manager::PipeManager;
use crate::sink::{FrameSink, FrameWriter};
use crate::stats::{SessionStats, SessionStatsSnapshot};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nexnet_proto::{
    decode_message, encode_message, Disconnect, DisconnectReason, Frame, FrameCodec, FrameType,
    Handshake, MethodId, PipeId, ProtocolError, Role, MAX_FRAME_SIZE_LIMIT, PROTOCOL_VERSION,
};
use nexnet_transport::{BoxedReader, Transport, TransportError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

type FrameReader = FramedRead<BoxedReader, FrameCodec>;

/// Connection state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Client handle only: waiting to establish a replacement session
    Reconnecting,
    /// Lost to a transport failure or timeout
    Disconnected,
    /// Closed on purpose or after a protocol error
    Closed,
}

/// Values both peers agreed on during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol_version: u32,
    pub max_frame_size: u32,
    pub pipe_credit: u32,
}

pub struct Session {
    id: Uuid,
    role: Role,
    peer: String,
    negotiated: Negotiated,
    config: SessionConfig,
    identity: Arc<ConnectionIdentity>,
    sink: Arc<FrameSink>,
    pipes: Arc<PipeManager>,
    dispatcher: Arc<InvocationDispatcher>,
    stats: Arc<SessionStats>,
    state: watch::Sender<ConnectionState>,
    closed_reason: watch::Sender<Option<DisconnectReason>>,
    /// Reason and linger flag of a locally requested close
    local_close: Mutex<Option<(DisconnectReason, bool)>>,
    torn_down: AtomicBool,
    shutdown: CancellationToken,
    started: Instant,
    last_activity_ms: AtomicU64,
    ping_seq: AtomicU32,
}

impl Session {
    /// Establish a session as the initiator over a connected transport
    pub async fn connect(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        methods: Arc<MethodTable>,
    ) -> Result<Arc<Session>, SessionError> {
        Self::establish(transport, Role::Initiator, config, methods, None).await
    }

    /// Establish a session as the acceptor over an accepted transport
    pub async fn accept(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        methods: Arc<MethodTable>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Arc<Session>, SessionError> {
        Self::establish(transport, Role::Acceptor, config, methods, authenticator).await
    }

    async fn establish(
        transport: Box<dyn Transport>,
        role: Role,
        config: SessionConfig,
        methods: Arc<MethodTable>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Arc<Session>, SessionError> {
        config.validate()?;

        let id = Uuid::new_v4();
        let peer = transport.peer();
        let (reader, writer) = transport.into_split();

        let codec = FrameCodec::with_pool(config.buffer_pool.clone())
            .with_max_frame_size(config.max_frame_size as usize)
            .with_strict(config.strict_frame_types);
        let mut frames_in = FramedRead::new(reader, codec.clone());
        let mut frames_out = FramedWrite::new(writer, codec);

        let local = Handshake {
            protocol_version: PROTOCOL_VERSION,
            method_hash: methods.method_hash(),
            role,
            max_frame_size: config.max_frame_size,
            initial_pipe_credit: config.initial_pipe_credit,
            auth_token: match role {
                Role::Initiator => config.auth_token.clone(),
                Role::Acceptor => None,
            },
        };

        debug!(session_id = %id, peer = %peer, ?role, "Starting handshake");
        let exchange = exchange_handshakes(
            &mut frames_in,
            &mut frames_out,
            &local,
            authenticator.as_deref(),
        );
        let (remote, principal) = match tokio::time::timeout(config.handshake_timeout, exchange).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(session_id = %id, peer = %peer, "Handshake failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                warn!(session_id = %id, peer = %peer, "Handshake timed out");
                return Err(SessionError::HandshakeTimeout);
            }
        };

        let negotiated = Negotiated {
            protocol_version: PROTOCOL_VERSION,
            max_frame_size: local.max_frame_size.min(remote.max_frame_size),
            pipe_credit: local.initial_pipe_credit.min(remote.initial_pipe_credit),
        };
        frames_in
            .decoder_mut()
            .set_max_frame_size(negotiated.max_frame_size as usize);
        frames_out
            .encoder_mut()
            .set_max_frame_size(negotiated.max_frame_size as usize);

        let stats = Arc::new(SessionStats::default());
        let sink = FrameSink::new(frames_out, stats.clone());
        let params = PipeParams {
            max_chunk: negotiated.max_frame_size as usize,
            window: negotiated.pipe_credit,
            open_timeout: config.pipe_open_timeout,
        };
        let pipes = Arc::new(PipeManager::new(
            role,
            sink.clone(),
            params,
            config.max_concurrent_pipes,
            stats.clone(),
        ));
        let identity = Arc::new(ConnectionIdentity {
            session_id: id,
            peer: peer.clone(),
            principal,
        });
        let shutdown = CancellationToken::new();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (closed_reason, _) = watch::channel(None);

        let session = Arc::new_cyclic(|weak| {
            let dispatcher = Arc::new(InvocationDispatcher::new(
                sink.clone(),
                pipes.clone(),
                methods,
                identity.clone(),
                weak.clone(),
                config.max_pending_invocations,
                shutdown.child_token(),
                stats.clone(),
            ));

            Session {
                id,
                role,
                peer,
                negotiated,
                config,
                identity,
                sink,
                pipes,
                dispatcher,
                stats,
                state,
                closed_reason,
                local_close: Mutex::new(None),
                torn_down: AtomicBool::new(false),
                shutdown,
                started: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                ping_seq: AtomicU32::new(0),
            }
        });

        info!(
            session_id = %session.id,
            peer = %session.peer,
            role = ?role,
            max_frame_size = negotiated.max_frame_size,
            pipe_credit = negotiated.pipe_credit,
            "Session established"
        );

        tokio::spawn(session.clone().run_receive_loop(frames_in));
        tokio::spawn(session.clone().run_keepalive());

        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Peer description reported by the transport
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_pipes(&self) -> usize {
        self.pipes.active_count()
    }

    pub fn pending_invocations(&self) -> usize {
        self.dispatcher.pending_count()
    }

    pub fn running_handlers(&self) -> usize {
        self.dispatcher.running_count()
    }

    /// Open a pipe to pass to the peer in an invocation
    pub async fn open_pipe(&self) -> Result<NexusPipe, PipeError> {
        self.pipes.open_pipe().await
    }

    /// Open a pipe wrapped as a typed channel
    pub async fn open_channel<T, C>(&self) -> Result<NexusChannel<T, C>, PipeError>
    where
        T: Serialize + DeserializeOwned,
        C: PayloadCodec,
    {
        Ok(NexusChannel::new(self.open_pipe().await?))
    }

    /// Invoke a method with raw arguments; `Ok(None)` is a void result
    pub async fn invoke(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, InvokeError> {
        self.dispatcher
            .invoke(method_id, arguments.into(), Vec::new(), None)
            .await
    }

    /// Invoke a method passing pipes opened with [`Session::open_pipe`]
    pub async fn invoke_with_pipes(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
    ) -> Result<Option<Bytes>, InvokeError> {
        self.dispatcher
            .invoke(method_id, arguments.into(), pipes.to_vec(), None)
            .await
    }

    /// Invoke a method that can be abandoned through `cancel`
    pub async fn invoke_cancellable(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, InvokeError> {
        self.dispatcher
            .invoke(method_id, arguments.into(), pipes.to_vec(), Some(cancel))
            .await
    }

    /// Invoke a method without waiting for (or receiving) a response
    pub async fn invoke_oneway(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
    ) -> Result<(), InvokeError> {
        self.dispatcher
            .invoke_oneway(method_id, arguments.into(), pipes.to_vec())
            .await
    }

    /// Invoke with typed arguments and result encoded by `C`
    pub async fn invoke_typed<A, R, C>(&self, method_id: MethodId, arguments: &A) -> Result<R, InvokeError>
    where
        A: Serialize,
        R: DeserializeOwned,
        C: PayloadCodec,
    {
        let encoded = C::encode(arguments)?;
        let result = self.invoke(method_id, encoded).await?;
        Ok(C::decode(result.as_deref().unwrap_or_default())?)
    }

    /// Close gracefully: notify the peer, flush, then release the transport
    pub async fn close(&self) {
        self.close_with(DisconnectReason::Graceful, None).await;
    }

    /// Close gracefully with an explicit reason for the peer
    pub async fn close_with(&self, reason: DisconnectReason, message: Option<String>) {
        if self.begin_local_close(reason, true) {
            match encode_message(&Disconnect { reason, message }) {
                Ok(payload) => {
                    if let Err(e) = self.sink.send(Frame::disconnect(payload)).await {
                        debug!(session_id = %self.id, "Could not send disconnect: {}", e);
                    }
                }
                Err(e) => error!(session_id = %self.id, "Failed to encode disconnect: {}", e),
            }
            self.shutdown.cancel();
        }
        self.closed().await;
    }

    /// Close immediately without notifying the peer or flushing
    pub fn abort(&self) {
        self.abort_with(DisconnectReason::Graceful);
    }

    fn abort_with(&self, reason: DisconnectReason) {
        if self.begin_local_close(reason, false) {
            self.shutdown.cancel();
        }
    }

    fn begin_local_close(&self, reason: DisconnectReason, linger: bool) -> bool {
        let mut local_close = self
            .local_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if local_close.is_some() || self.torn_down.load(Ordering::Acquire) {
            return false;
        }
        *local_close = Some((reason, linger));
        true
    }

    /// Resolves with the disconnect reason once the session is fully closed
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.closed_reason.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return DisconnectReason::TransportError;
            }
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    async fn run_receive_loop(self: Arc<Self>, mut frames: FrameReader) {
        let (reason, linger) = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let local_close = *self
                        .local_close
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    break local_close.unwrap_or((DisconnectReason::Graceful, true));
                }
                _ = self.sink.failed() => {
                    warn!(session_id = %self.id, "Transport write failed");
                    break (DisconnectReason::TransportError, false);
                }
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        self.touch();
                        self.stats.record_received(frame.encoded_len());
                        match self.process_frame(frame) {
                            Ok(None) => {}
                            Ok(Some(reason)) => break (reason, true),
                            Err(e) => {
                                error!(session_id = %self.id, "Protocol error: {}", e);
                                break (DisconnectReason::ProtocolError, false);
                            }
                        }
                    }
                    Some(Err(ProtocolError::Io(e))) => {
                        warn!(session_id = %self.id, "Transport read failed: {}", e);
                        break (DisconnectReason::TransportError, false);
                    }
                    Some(Err(e)) => {
                        error!(session_id = %self.id, "Protocol error: {}", e);
                        break (DisconnectReason::ProtocolError, false);
                    }
                    None => {
                        info!(session_id = %self.id, "Peer closed the transport");
                        break (DisconnectReason::TransportError, false);
                    }
                },
            }
        };

        drop(frames);
        self.teardown(reason, linger).await;
    }

    fn process_frame(&self, frame: Frame) -> Result<Option<DisconnectReason>, ProtocolError> {
        trace!(
            session_id = %self.id,
            frame_type = ?frame.frame_type,
            id = frame.id,
            len = frame.payload.len(),
            "Received frame"
        );

        match frame.frame_type {
            FrameType::Handshake => return Err(ProtocolError::UnexpectedFrame(FrameType::Handshake)),
            FrameType::Ping => self.sink.enqueue(Frame::pong(frame.id)),
            FrameType::Pong => trace!(session_id = %self.id, sequence = frame.id, "Pong"),
            FrameType::InvocationRequest => self.dispatcher.handle_request(frame),
            FrameType::InvocationResponse => self.dispatcher.complete(frame.id, &frame.payload)?,
            FrameType::InvocationCancel => self.dispatcher.cancel_inbound(frame.id),
            FrameType::PipeOpen if frame.flags.has_ack() => self.pipes.acknowledge(frame.id),
            FrameType::PipeOpen => self.pipes.accept_incoming(frame.id),
            FrameType::PipeData => self.pipes.route_data(frame.id, frame.payload),
            FrameType::PipeCredit => {
                let amount = frame.credit_amount().ok_or_else(|| {
                    ProtocolError::Malformed("credit frame without a 4-byte amount".to_string())
                })?;
                self.pipes.apply_credit(frame.id, amount);
            }
            FrameType::PipeClose => self.pipes.remote_close(frame.id, frame.flags.has_rst()),
            FrameType::Disconnect => {
                let reason = match decode_message::<Disconnect>(&frame.payload) {
                    Ok(notice) => {
                        info!(
                            session_id = %self.id,
                            reason = %notice.reason,
                            message = ?notice.message,
                            "Peer disconnected"
                        );
                        notice.reason
                    }
                    Err(e) => {
                        debug!(session_id = %self.id, "Unreadable disconnect notice: {}", e);
                        DisconnectReason::Graceful
                    }
                };
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    async fn run_keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let idle = self.idle_for();
                    if idle >= self.config.idle_timeout {
                        warn!(
                            session_id = %self.id,
                            idle_ms = idle.as_millis() as u64,
                            "Peer idle for too long, closing session"
                        );
                        self.abort_with(DisconnectReason::Timeout);
                        break;
                    }
                    let sequence = self.ping_seq.fetch_add(1, Ordering::Relaxed);
                    self.sink.enqueue(Frame::ping(sequence));
                }
            }
        }
    }

    async fn teardown(&self, reason: DisconnectReason, linger: bool) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.dispatcher.abort_all();
        self.pipes.abort_all();
        self.shutdown.cancel();
        self.sink.close(linger).await;

        let final_state = if reason.is_reconnectable() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Closed
        };
        self.state.send_replace(final_state);
        self.closed_reason.send_replace(Some(reason));

        info!(session_id = %self.id, peer = %self.peer, %reason, "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

/// Initiator sends first; the acceptor validates before answering so a
/// mismatch fails `connect` on both sides.
async fn exchange_handshakes(
    frames_in: &mut FrameReader,
    frames_out: &mut FrameWriter,
    local: &Handshake,
    authenticator: Option<&dyn Authenticator>,
) -> Result<(Handshake, Option<String>), SessionError> {
    match local.role {
        Role::Initiator => {
            send_handshake(frames_out, local).await?;
            let remote = read_handshake(frames_in).await?;
            if let Err((reason, error)) = validate_handshake(local, &remote) {
                reject(frames_out, reason, error.to_string()).await;
                return Err(error);
            }
            Ok((remote, None))
        }
        Role::Acceptor => {
            let remote = read_handshake(frames_in).await?;
            if let Err((reason, error)) = validate_handshake(local, &remote) {
                reject(frames_out, reason, error.to_string()).await;
                return Err(error);
            }

            let principal = match authenticator {
                Some(authenticator) => match authenticator.authenticate(remote.auth_token.as_deref()) {
                    Ok(principal) => principal,
                    Err(message) => {
                        reject(frames_out, DisconnectReason::Authentication, message.clone()).await;
                        return Err(SessionError::AuthenticationFailed(message));
                    }
                },
                None => None,
            };

            send_handshake(frames_out, local).await?;
            Ok((remote, principal))
        }
    }
}

async fn send_handshake(frames_out: &mut FrameWriter, handshake: &Handshake) -> Result<(), SessionError> {
    let payload = encode_message(handshake)?;
    frames_out
        .send(Frame::handshake(payload))
        .await
        .map_err(io_to_transport)
}

async fn read_handshake(frames_in: &mut FrameReader) -> Result<Handshake, SessionError> {
    let frame = match frames_in.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(io_to_transport(e)),
        None => return Err(SessionError::Transport(TransportError::Closed)),
    };

    match frame.frame_type {
        FrameType::Handshake => Ok(decode_message(&frame.payload)?),
        FrameType::Disconnect => {
            let notice: Disconnect = decode_message(&frame.payload)?;
            Err(SessionError::HandshakeRejected {
                reason: notice.reason,
                message: notice.message,
            })
        }
        other => Err(SessionError::Protocol(ProtocolError::UnexpectedFrame(other))),
    }
}

fn validate_handshake(
    local: &Handshake,
    remote: &Handshake,
) -> Result<(), (DisconnectReason, SessionError)> {
    if remote.protocol_version != local.protocol_version {
        return Err((
            DisconnectReason::VersionMismatch,
            SessionError::VersionMismatch {
                local: local.protocol_version,
                remote: remote.protocol_version,
            },
        ));
    }
    if remote.role != local.role.opposite() {
        return Err((
            DisconnectReason::ProtocolError,
            SessionError::Protocol(ProtocolError::Malformed(format!(
                "peer claims role {:?}",
                remote.role
            ))),
        ));
    }
    if remote.method_hash != local.method_hash {
        return Err((
            DisconnectReason::MethodHashMismatch,
            SessionError::MethodHashMismatch {
                local: local.method_hash,
                remote: remote.method_hash,
            },
        ));
    }
    if remote.max_frame_size < MIN_FRAME_SIZE
        || remote.max_frame_size > MAX_FRAME_SIZE_LIMIT
        || remote.initial_pipe_credit == 0
    {
        return Err((
            DisconnectReason::ProtocolError,
            SessionError::Protocol(ProtocolError::Malformed(format!(
                "unacceptable limits: max_frame_size {}, initial_pipe_credit {}",
                remote.max_frame_size, remote.initial_pipe_credit
            ))),
        ));
    }
    Ok(())
}

/// Tell the peer why the handshake failed, then shut our write half
async fn reject(frames_out: &mut FrameWriter, reason: DisconnectReason, message: String) {
    let payload = match encode_message(&Disconnect {
        reason,
        message: Some(message),
    }) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode disconnect: {}", e);
            return;
        }
    };
    if let Err(e) = frames_out.send(Frame::disconnect(payload)).await {
        debug!("Could not send handshake rejection: {}", e);
        return;
    }
    if let Err(e) = SinkExt::<Frame>::close(frames_out).await {
        debug!("Could not close transport after rejection: {}", e);
    }
}

fn io_to_transport(error: ProtocolError) -> SessionError {
    match error {
        ProtocolError::Io(e) => SessionError::Transport(TransportError::from(e)),
        other => SessionError::Protocol(other),
    }
}
