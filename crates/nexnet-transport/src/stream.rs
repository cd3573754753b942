//! Byte-stream transports: any tokio stream, and TCP connect/accept

use crate::{BoxedReader, BoxedWriter, Connector, Listener, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

/// Transport over any duplex tokio stream (TCP, TLS, upgraded HTTP, ...)
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + Debug + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + Debug + 'static,
{
    fn into_split(self: Box<Self>) -> (BoxedReader, BoxedWriter) {
        let (reader, writer) = tokio::io::split(self.stream);
        (Box::new(reader), Box::new(writer))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Connects to a fixed TCP address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> TransportResult<Box<dyn Transport>> {
        debug!(addr = %self.addr, "Connecting TCP transport");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Box::new(StreamTransport::new(stream, self.addr.to_string())))
    }
}

/// Accepts TCP transports on a bound socket
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl TcpTransportListener {
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP transport listener bound");

        Ok(Self {
            listener,
            local_addr,
            shutdown: watch::channel(false).0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> TransportResult<Box<dyn Transport>> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(TransportError::Closed);
        }

        let (stream, peer_addr) = tokio::select! {
            accepted = self.listener.accept() => accepted?,
            _ = shutdown.changed() => return Err(TransportError::Closed),
        };
        stream.set_nodelay(true)?;
        debug!(peer = %peer_addr, "Accepted TCP transport");

        Ok(Box::new(StreamTransport::new(stream, peer_addr.to_string())))
    }

    fn local_description(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        info!(addr = %self.local_addr, "TCP transport listener closed");
    }
}
