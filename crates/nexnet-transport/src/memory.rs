//! In-memory duplex transports
//!
//! Useful for tests and for embedding two peers in one process. A
//! [`MemoryConnector`] hands one end of a fresh `tokio::io::duplex` pair to
//! its [`MemoryListener`] on every connect.

use crate::{Connector, Listener, StreamTransport, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Create two connected in-memory transports
pub fn memory_pair(
    buffer_size: usize,
) -> (StreamTransport<DuplexStream>, StreamTransport<DuplexStream>) {
    let (a, b) = tokio::io::duplex(buffer_size);
    (
        StreamTransport::new(a, "memory:a"),
        StreamTransport::new(b, "memory:b"),
    )
}

/// Create a connected in-memory listener/connector pair
pub fn memory_listener(name: &str) -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::channel(16);
    let listener = MemoryListener {
        name: name.to_string(),
        incoming: Mutex::new(rx),
        shutdown: watch::channel(false).0,
    };
    let connector = MemoryConnector {
        name: name.to_string(),
        buffer_size: DEFAULT_BUFFER_SIZE,
        outgoing: tx,
        refusing: Arc::new(AtomicBool::new(false)),
        connects: Arc::new(AtomicU64::new(0)),
    };
    (listener, connector)
}

/// Accepts transports created by a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    incoming: Mutex<mpsc::Receiver<Box<dyn Transport>>>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> TransportResult<Box<dyn Transport>> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(TransportError::Closed);
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            transport = incoming.recv() => transport.ok_or(TransportError::Closed),
            _ = shutdown.changed() => Err(TransportError::Closed),
        }
    }

    fn local_description(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        // A pending accept observes the shutdown and releases the lock
        self.incoming.lock().await.close();
    }
}

/// Creates in-memory transports toward a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    name: String,
    buffer_size: usize,
    outgoing: mpsc::Sender<Box<dyn Transport>>,
    refusing: Arc<AtomicBool>,
    connects: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Make subsequent connects fail with `Refused` until cleared
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> TransportResult<Box<dyn Transport>> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(format!("memory://{}", self.name)));
        }

        let (local, remote) = memory_pair(self.buffer_size);
        self.outgoing
            .send(Box::new(remote))
            .await
            .map_err(|_| TransportError::Refused(format!("memory://{} is closed", self.name)))?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(name = %self.name, "Connected in-memory transport");
        Ok(Box::new(local))
    }
}
