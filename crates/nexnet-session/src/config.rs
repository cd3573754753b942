//! Session, client and server configuration

use crate::dispatch::Authenticator;
use crate::error::ConfigError;
use crate::reconnect::{ExponentialBackoff, ReconnectPolicy};
use nexnet_proto::{BufferPool, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PIPE_CREDIT, MAX_FRAME_SIZE_LIMIT};
use std::sync::Arc;
use std::time::Duration;

/// Smallest max frame size a peer may propose
pub const MIN_FRAME_SIZE: u32 = 1024;

/// Settings shared by both ends of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest frame payload this side accepts (negotiated down to the peer's)
    pub max_frame_size: u32,

    /// Per-pipe flow-control window in bytes (negotiated down to the peer's)
    pub initial_pipe_credit: u32,

    /// Pipes that may be open at once, counting both directions
    pub max_concurrent_pipes: usize,

    /// Outbound invocations awaiting a response
    pub max_pending_invocations: usize,

    /// How long to wait for the peer's handshake
    pub handshake_timeout: Duration,

    /// Keep-alive interval (ping frames)
    pub ping_interval: Duration,

    /// Close the session when nothing was received for this long
    pub idle_timeout: Duration,

    /// How long an opened pipe waits for the peer's acknowledgement
    pub pipe_open_timeout: Duration,

    /// Reject frames with unknown type tags instead of skipping them
    pub strict_frame_types: bool,

    /// Credential presented in the initiator's handshake
    pub auth_token: Option<String>,

    /// Pool backing received frame payloads
    pub buffer_pool: BufferPool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            initial_pipe_credit: DEFAULT_PIPE_CREDIT,
            max_concurrent_pipes: 1024,
            max_pending_invocations: 1024,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            pipe_open_timeout: Duration::from_secs(10),
            strict_frame_types: true,
            auth_token: None,
            buffer_pool: BufferPool::shared(),
        }
    }
}

impl SessionConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_initial_pipe_credit(mut self, credit: u32) -> Self {
        self.initial_pipe_credit = credit;
        self
    }

    pub fn with_max_concurrent_pipes(mut self, max: usize) -> Self {
        self.max_concurrent_pipes = max;
        self
    }

    pub fn with_max_pending_invocations(mut self, max: usize) -> Self {
        self.max_pending_invocations = max;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the keep-alive interval and the idle timeout together
    pub fn with_keep_alive(mut self, ping_interval: Duration, idle_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_pipe_open_timeout(mut self, timeout: Duration) -> Self {
        self.pipe_open_timeout = timeout;
        self
    }

    pub fn with_strict_frame_types(mut self, strict: bool) -> Self {
        self.strict_frame_types = strict;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.buffer_pool = pool;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < MIN_FRAME_SIZE || self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between {} and {} bytes, got {}",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT, self.max_frame_size
            )));
        }
        if self.initial_pipe_credit == 0 {
            return Err(ConfigError::Invalid(
                "initial_pipe_credit must be non-zero".to_string(),
            ));
        }
        if self.max_concurrent_pipes == 0 || self.max_pending_invocations == 0 {
            return Err(ConfigError::Invalid(
                "pipe and invocation limits must be non-zero".to_string(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.idle_timeout {
            return Err(ConfigError::Invalid(format!(
                "ping_interval ({:?}) must be non-zero and shorter than idle_timeout ({:?})",
                self.ping_interval, self.idle_timeout
            )));
        }
        if self.handshake_timeout.is_zero() || self.pipe_open_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Client handle configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionConfig,

    /// Reconnection policy (None = never reconnect)
    pub reconnect: Option<Arc<dyn ReconnectPolicy>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reconnect: Some(Arc::new(ExponentialBackoff::default())),
        }
    }
}

impl ClientConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect = Some(Arc::new(policy));
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = None;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()
    }
}

/// Server configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub session: SessionConfig,

    /// Checks the initiator's handshake token (None = accept everyone)
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("session", &self.session)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()
    }
}
