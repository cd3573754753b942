//! Server accept loop
//!
//! Every accepted transport runs the acceptor handshake on its own task; live
//! sessions are tracked in a [`ConnectionRegistry`] until they close.

use crate::config::ServerConfig;
use crate::dispatch::MethodTable;
use crate::error::SessionError;
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use futures::future::join_all;
use nexnet_proto::DisconnectReason;
use nexnet_transport::{Listener, Transport, TransportError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ServerInner {
    listener: Arc<dyn Listener>,
    config: ServerConfig,
    methods: Arc<MethodTable>,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct NexusServer {
    inner: Arc<ServerInner>,
}

impl NexusServer {
    pub fn new(
        listener: impl Listener + 'static,
        config: ServerConfig,
        methods: MethodTable,
    ) -> Result<NexusServer, SessionError> {
        config.validate()?;

        Ok(NexusServer {
            inner: Arc::new(ServerInner {
                listener: Arc::new(listener),
                config,
                methods: Arc::new(methods),
                registry: ConnectionRegistry::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Build a server and run its accept loop in the background
    pub fn serve(
        listener: impl Listener + 'static,
        config: ServerConfig,
        methods: MethodTable,
    ) -> Result<NexusServer, SessionError> {
        let server = Self::new(listener, config, methods)?;
        let runner = server.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("Server accept loop failed: {}", e);
            }
        });
        Ok(server)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn local_description(&self) -> String {
        self.inner.listener.local_description()
    }

    /// Accept transports until the listener closes or `shutdown` is called
    pub async fn run(&self) -> Result<(), SessionError> {
        info!(listener = %self.local_description(), "Server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = self.inner.listener.accept() => accepted,
            };

            match accepted {
                Ok(transport) => {
                    debug!(peer = %transport.peer(), "Accepted transport");
                    tokio::spawn(handle_connection(self.inner.clone(), transport));
                }
                Err(TransportError::Closed) => {
                    debug!("Listener closed");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Failed to accept connection: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(listener = %self.local_description(), "Server stopped accepting");
        Ok(())
    }

    /// Stop accepting and send every session a server-shutdown notice
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.listener.close().await;

        let sessions = self.inner.registry.sessions();
        info!(sessions = sessions.len(), "Shutting down server");

        join_all(sessions.iter().map(|session| {
            session.close_with(
                DisconnectReason::ServerShutdown,
                Some("server shutting down".to_string()),
            )
        }))
        .await;
    }
}

impl std::fmt::Debug for NexusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NexusServer")
            .field("listener", &self.inner.listener)
            .field("sessions", &self.inner.registry.count())
            .finish()
    }
}

async fn handle_connection(inner: Arc<ServerInner>, transport: Box<dyn Transport>) {
    let peer = transport.peer();
    let session = match Session::accept(
        transport,
        inner.config.session.clone(),
        inner.methods.clone(),
        inner.config.authenticator.clone(),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = %peer, "Rejected connection: {}", e);
            return;
        }
    };

    let id = session.id();
    inner.registry.register(session.clone());

    // shutdown() may have taken its snapshot before this registration
    if inner.shutdown.is_cancelled() {
        session
            .close_with(
                DisconnectReason::ServerShutdown,
                Some("server shutting down".to_string()),
            )
            .await;
    }

    let reason = session.closed().await;
    inner.registry.unregister(id);
    debug!(session_id = %id, peer = %peer, %reason, "Connection finished");
}
