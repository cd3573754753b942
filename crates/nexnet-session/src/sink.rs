//! Serialized frame writer shared by every producer in a session
//!
//! All writes go through one lock so frames from concurrent producers never
//! interleave. Control replies issued from the receive loop (pong, pipe
//! acknowledgements, credit, resets) are queued to a writer task instead, so
//! the receive loop never blocks on a full transport.

use crate::error::SessionError;
use crate::stats::SessionStats;
use futures::SinkExt;
use nexnet_proto::{Frame, FrameCodec, ProtocolError};
use nexnet_transport::{close_writer, BoxedWriter, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

/// Upper bound on flushing buffered frames during a graceful close
const LINGER_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

enum Control {
    Frame(Frame),
    /// Answered once every frame queued before it has been written
    Drained(oneshot::Sender<()>),
}

pub(crate) struct FrameSink {
    writer: Mutex<Option<FrameWriter>>,
    control_tx: mpsc::UnboundedSender<Control>,
    failed: CancellationToken,
    closing: AtomicBool,
    closed: AtomicBool,
    stats: Arc<SessionStats>,
    self_ref: Weak<FrameSink>,
}

impl FrameSink {
    pub(crate) fn new(writer: FrameWriter, stats: Arc<SessionStats>) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let sink = Arc::new_cyclic(|self_ref| Self {
            writer: Mutex::new(Some(writer)),
            control_tx,
            failed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats,
            self_ref: self_ref.clone(),
        });

        tokio::spawn(run_control_writer(Arc::downgrade(&sink), control_rx));
        sink
    }

    /// Write one frame and flush it
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        let len = frame.encoded_len();
        trace!(
            frame_type = ?frame.frame_type,
            id = frame.id,
            len = frame.payload.len(),
            "Sending frame"
        );

        match writer.send(frame).await {
            Ok(()) => {
                self.stats.record_sent(len);
                Ok(())
            }
            Err(ProtocolError::Io(e)) => {
                debug!("Frame write failed: {}", e);
                self.failed.cancel();
                Err(SessionError::Transport(TransportError::from(e)))
            }
            Err(e) => Err(SessionError::Protocol(e)),
        }
    }

    /// Queue a frame for the writer task without waiting
    pub(crate) fn enqueue(&self, frame: Frame) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if self.control_tx.send(Control::Frame(frame)).is_err() {
            trace!("Control writer gone, dropping frame");
        }
    }

    /// Resolves once a write hit a transport error
    pub(crate) fn failed(&self) -> WaitForCancellationFuture<'_> {
        self.failed.cancelled()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop writing and release the transport
    ///
    /// With `linger` set, queued control frames are written, buffered frames
    /// are flushed and the write half is shut down cleanly; otherwise the
    /// writer is dropped immediately.
    pub(crate) async fn close(&self, linger: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        if linger {
            let graceful = async {
                self.drain_control().await;
                self.closed.store(true, Ordering::Release);
                self.flush_and_shutdown().await;
            };
            match tokio::time::timeout(LINGER_TIMEOUT, graceful).await {
                Ok(()) => return,
                Err(_) => debug!("Graceful close timed out, dropping transport"),
            }
        }
        self.closed.store(true, Ordering::Release);

        match self.writer.try_lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(_) => {
                // A producer is mid-write; drop the transport once it lets go
                let this = self.self_ref.clone();
                tokio::spawn(async move {
                    if let Some(sink) = this.upgrade() {
                        drop(sink.writer.lock().await.take());
                    }
                });
            }
        }
    }
}

impl FrameSink {
    async fn drain_control(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control_tx.send(Control::Drained(done_tx)).is_ok() {
            // Err means the writer task already stopped
            let _ = done_rx.await;
        }
    }

    async fn flush_and_shutdown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = SinkExt::<Frame>::flush(&mut writer).await {
                debug!("Flush on close failed: {}", e);
            }
            if let Err(e) = close_writer(writer.into_inner(), true).await {
                debug!("Transport shutdown failed: {}", e);
            }
        }
    }
}

async fn run_control_writer(sink: Weak<FrameSink>, mut rx: mpsc::UnboundedReceiver<Control>) {
    while let Some(item) = rx.recv().await {
        let Some(sink) = sink.upgrade() else {
            break;
        };
        match item {
            Control::Frame(frame) => {
                if sink.send(frame).await.is_err() && sink.is_closed() {
                    break;
                }
            }
            Control::Drained(done) => {
                let _ = done.send(());
            }
        }
    }
}
