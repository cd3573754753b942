//! Reconnecting client handle
//!
//! [`NexusClient`] owns at most one live [`Session`]. When the session is lost
//! to a transport failure, a keep-alive timeout or a server shutdown, a
//! supervisor task establishes a replacement according to the configured
//! [`ReconnectPolicy`](crate::reconnect::ReconnectPolicy). The old session is
//! never revived; invocations in flight on it fail with `ConnectionAborted`.

use crate::codec::PayloadCodec;
use crate::config::ClientConfig;
use crate::dispatch::MethodTable;
use crate::error::{InvokeError, SessionError};
use crate::reconnect::ReconnectManager;
use crate::session::{ConnectionState, Session};
use bytes::Bytes;
use nexnet_proto::{DisconnectReason, MethodId, PipeId};
use nexnet_transport::Connector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Reconnecting { attempt: u32 },
    Reconnected,
    Disconnected { reason: DisconnectReason },
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    methods: Arc<MethodTable>,
    current: RwLock<Option<Arc<Session>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl ClientInner {
    async fn establish(&self) -> Result<Arc<Session>, SessionError> {
        let transport = self.connector.connect().await?;
        Session::connect(transport, self.config.session.clone(), self.methods.clone()).await
    }

    fn set_current(&self, session: Option<Arc<Session>>) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = session;
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Stable handle to a (re)connecting session
#[derive(Clone)]
pub struct NexusClient {
    inner: Arc<ClientInner>,
}

impl NexusClient {
    /// Connect once; the first failure is returned rather than retried
    pub async fn connect(
        connector: impl Connector + 'static,
        config: ClientConfig,
        methods: MethodTable,
    ) -> Result<NexusClient, SessionError> {
        config.validate()?;

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ClientInner {
            connector: Arc::new(connector),
            config,
            methods: Arc::new(methods),
            current: RwLock::new(None),
            state,
            events,
            shutdown: CancellationToken::new(),
        });

        let session = match inner.establish().await {
            Ok(session) => session,
            Err(e) => {
                inner.state.send_replace(ConnectionState::Closed);
                return Err(e);
            }
        };

        info!(session_id = %session.id(), peer = %session.peer(), "Client connected");
        inner.set_current(Some(session.clone()));
        inner.state.send_replace(ConnectionState::Connected);
        inner.emit(ClientEvent::Connected);

        tokio::spawn(supervise(inner.clone(), session));

        Ok(NexusClient { inner })
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.current()
    }

    fn require_session(&self) -> Result<Arc<Session>, InvokeError> {
        self.inner.current().ok_or(InvokeError::NotConnected)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub async fn invoke(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, InvokeError> {
        self.require_session()?.invoke(method_id, arguments).await
    }

    pub async fn invoke_with_pipes(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
    ) -> Result<Option<Bytes>, InvokeError> {
        self.require_session()?
            .invoke_with_pipes(method_id, arguments, pipes)
            .await
    }

    pub async fn invoke_cancellable(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, InvokeError> {
        self.require_session()?
            .invoke_cancellable(method_id, arguments, pipes, cancel)
            .await
    }

    pub async fn invoke_oneway(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        pipes: &[PipeId],
    ) -> Result<(), InvokeError> {
        self.require_session()?
            .invoke_oneway(method_id, arguments, pipes)
            .await
    }

    pub async fn invoke_typed<A, R, C>(&self, method_id: MethodId, arguments: &A) -> Result<R, InvokeError>
    where
        A: Serialize,
        R: DeserializeOwned,
        C: PayloadCodec,
    {
        self.require_session()?
            .invoke_typed::<A, R, C>(method_id, arguments)
            .await
    }

    /// Close the current session gracefully and stop reconnecting
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let session = self.inner.current();
        self.inner.set_current(None);
        if let Some(session) = session {
            session.close().await;
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        debug!("Client closed");
    }
}

impl std::fmt::Debug for NexusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NexusClient")
            .field("connector", &self.inner.connector)
            .field("state", &self.state())
            .finish()
    }
}

/// Watch the current session and replace it when it is lost
async fn supervise(inner: Arc<ClientInner>, mut session: Arc<Session>) {
    let mut manager = inner.config.reconnect.clone().map(ReconnectManager::new);

    loop {
        let reason = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            reason = session.closed() => reason,
        };

        inner.set_current(None);
        inner.emit(ClientEvent::Disconnected { reason });

        if inner.shutdown.is_cancelled() {
            return;
        }

        if !reason.is_reconnectable() {
            info!(session_id = %session.id(), %reason, "Session ended, not reconnecting");
            inner.state.send_replace(ConnectionState::Closed);
            return;
        }
        inner.state.send_replace(ConnectionState::Disconnected);

        let Some(manager) = manager.as_mut() else {
            info!(session_id = %session.id(), %reason, "Session lost, no reconnect policy");
            return;
        };

        let next_delay = manager.next_backoff();
        warn!(
            session_id = %session.id(),
            %reason,
            next_delay_ms = next_delay.map(|d| d.as_millis() as u64),
            "Session lost, reconnecting"
        );
        inner.state.send_replace(ConnectionState::Reconnecting);

        session = loop {
            inner.emit(ClientEvent::Reconnecting {
                attempt: manager.attempt() + 1,
            });

            if let Err(e) = manager.wait(&inner.shutdown).await {
                info!("Giving up reconnecting: {}", e);
                inner.state.send_replace(ConnectionState::Disconnected);
                return;
            }

            match inner.establish().await {
                Ok(session) => break session,
                Err(e) if e.is_retryable() => {
                    warn!(attempt = manager.attempt(), "Reconnection attempt failed: {}", e);
                }
                Err(e) => {
                    error!(attempt = manager.attempt(), "Reconnection rejected: {}", e);
                    inner.state.send_replace(ConnectionState::Closed);
                    return;
                }
            }
        };

        if inner.shutdown.is_cancelled() {
            session.close().await;
            return;
        }

        info!(
            session_id = %session.id(),
            attempts = manager.attempt(),
            "Client reconnected"
        );
        // A later loss starts again from the first delay
        manager.reset();
        inner.set_current(Some(session.clone()));
        inner.state.send_replace(ConnectionState::Connected);
        inner.emit(ClientEvent::Reconnected);
    }
}
