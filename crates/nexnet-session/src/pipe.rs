//! Nexus pipes: ordered, flow-controlled byte streams multiplexed over a session
//!
//! Each pipe has one reader and one writer. The writer spends byte credit
//! granted by the peer and blocks when it runs out; the reader hands credit
//! back once it has consumed half the window. Either side may complete its
//! write half independently; the pipe reports `Closed` only when both halves
//! are complete and every received byte has been read.
//!
//! ```text
//!  Unset ──open──▶ Opening ──ack/data──▶ Open ──FIN (either side)──▶ Draining
//!                     │                    │                            │
//!                     └────RST/abort───────┴──────RST/abort─────────────┤
//!                                                                       ▼
//!                                   both FIN + buffer drained ──────▶ Closed
//! ```

use crate::error::PipeError;
use crate::sink::FrameSink;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use nexnet_proto::{Frame, PipeId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Unset,
    /// Open sent, acknowledgement not yet received
    Opening,
    Open,
    /// One half completed, the other still running or data still buffered
    Draining,
    Closed,
}

pub(crate) type PipeTable = DashMap<PipeId, Arc<PipeShared>>;

/// Limits applied to every pipe of a session
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipeParams {
    /// Largest payload of a single Pipe-Data frame
    pub max_chunk: usize,
    /// Flow-control window in bytes
    pub window: u32,
    pub open_timeout: Duration,
}

/// Result of handing a received data frame to a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataOutcome {
    Accepted,
    /// Pipe no longer accepts data; frame discarded
    Dropped,
    /// Peer sent more than its credit; the pipe has been failed
    Violation,
}

pub(crate) struct PipeShared {
    id: PipeId,
    sink: Arc<FrameSink>,
    table: Weak<PipeTable>,
    params: PipeParams,
    inner: Mutex<PipeInner>,
    readable: Notify,
    writable: Notify,
    opened: Notify,
}

struct PipeInner {
    state: PipeState,
    queue: VecDeque<Bytes>,
    buffered: usize,
    local_fin: bool,
    remote_fin: bool,
    reader_detached: bool,
    /// Terminal error caused by the peer or the session
    failure: Option<PipeError>,
    open_result: Option<Result<(), PipeError>>,
    /// Bytes we may still send
    send_credit: u64,
    /// Bytes received that have not been granted back yet
    recv_outstanding: u64,
    /// Bytes read locally since the last grant
    consumed_ungranted: u64,
}

impl PipeShared {
    pub(crate) fn new(
        id: PipeId,
        opening: bool,
        sink: Arc<FrameSink>,
        table: Weak<PipeTable>,
        params: PipeParams,
    ) -> Arc<Self> {
        let (state, open_result) = if opening {
            (PipeState::Opening, None)
        } else {
            (PipeState::Open, Some(Ok(())))
        };

        Arc::new(Self {
            id,
            sink,
            table,
            params,
            inner: Mutex::new(PipeInner {
                state,
                queue: VecDeque::new(),
                buffered: 0,
                local_fin: false,
                remote_fin: false,
                reader_detached: false,
                failure: None,
                open_result,
                send_credit: params.window as u64,
                recv_outstanding: 0,
                consumed_ungranted: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            opened: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> PipeId {
        self.id
    }

    pub(crate) fn state(&self) -> PipeState {
        self.lock().state
    }

    pub(crate) fn buffered(&self) -> usize {
        self.lock().buffered
    }

    pub(crate) fn send_credit(&self) -> u64 {
        self.lock().send_credit
    }

    pub(crate) fn window(&self) -> u32 {
        self.params.window
    }

    pub(crate) fn is_write_complete(&self) -> bool {
        let inner = self.lock();
        inner.local_fin || inner.state == PipeState::Closed
    }

    fn notify_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.opened.notify_waiters();
    }

    fn remove_from_table(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.id);
        }
        debug!(pipe_id = self.id, "Pipe closed");
    }

    /// Advance Open/Draining/Closed after a half completed or data drained.
    /// Returns true when this call moved the pipe to `Closed`.
    fn settle(inner: &mut PipeInner) -> bool {
        if inner.state == PipeState::Closed {
            return false;
        }
        if inner.local_fin && inner.remote_fin && inner.queue.is_empty() {
            inner.state = PipeState::Closed;
            return true;
        }
        if inner.local_fin || inner.remote_fin {
            inner.state = PipeState::Draining;
        }
        false
    }

    fn mark_opened(inner: &mut PipeInner) {
        if inner.state == PipeState::Opening {
            inner.state = PipeState::Open;
        }
        if inner.open_result.is_none() {
            inner.open_result = Some(Ok(()));
        }
    }

    fn take_grant(inner: &mut PipeInner, threshold: u64) -> Option<u32> {
        if inner.state == PipeState::Closed || inner.remote_fin || inner.consumed_ungranted == 0 {
            return None;
        }
        if inner.consumed_ungranted < threshold {
            return None;
        }
        let grant = inner.consumed_ungranted.min(u32::MAX as u64);
        inner.consumed_ungranted -= grant;
        inner.recv_outstanding = inner.recv_outstanding.saturating_sub(grant);
        Some(grant as u32)
    }

    fn grant_threshold(&self) -> u64 {
        (self.params.window as u64 / 2).max(1)
    }

    fn send_grant(&self, grant: Option<u32>) {
        if let Some(amount) = grant {
            self.sink.enqueue(Frame::pipe_credit(self.id, amount));
        }
    }

    /// Peer acknowledged our open
    pub(crate) fn mark_open(&self) {
        Self::mark_opened(&mut self.lock());
        self.notify_all();
    }

    /// Wait for the peer to acknowledge or reject our open
    pub(crate) async fn ready(&self) -> Result<(), PipeError> {
        let wait = async {
            loop {
                let notified = self.opened.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let result = self.lock().open_result.clone();
                if let Some(result) = result {
                    return result;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.params.open_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pipe_id = self.id, "Pipe open was not acknowledged in time");
                self.reset();
                Err(PipeError::OpenTimeout)
            }
        }
    }

    /// Hand a received Pipe-Data payload to the pipe
    pub(crate) fn push_data(&self, payload: Bytes) -> DataOutcome {
        let len = payload.len() as u64;
        let mut inner = self.lock();

        if inner.state == PipeState::Closed || inner.remote_fin || inner.failure.is_some() {
            return DataOutcome::Dropped;
        }
        Self::mark_opened(&mut inner);

        inner.recv_outstanding += len;
        if inner.recv_outstanding > self.params.window as u64 {
            inner.failure = Some(PipeError::CreditViolation);
            inner.state = PipeState::Closed;
            inner.queue.clear();
            inner.buffered = 0;
            drop(inner);

            self.notify_all();
            self.remove_from_table();
            return DataOutcome::Violation;
        }

        let grant = if inner.reader_detached {
            inner.consumed_ungranted += len;
            Self::take_grant(&mut inner, self.grant_threshold())
        } else {
            inner.queue.push_back(payload);
            inner.buffered += len as usize;
            None
        };
        drop(inner);

        self.notify_all();
        self.send_grant(grant);
        DataOutcome::Accepted
    }

    /// Peer granted more send credit
    pub(crate) fn add_credit(&self, amount: u32) {
        let mut inner = self.lock();
        if inner.state == PipeState::Closed {
            return;
        }
        Self::mark_opened(&mut inner);
        inner.send_credit = inner.send_credit.saturating_add(amount as u64);
        drop(inner);

        self.notify_all();
    }

    /// Peer completed its write half (FIN) or aborted the pipe (RST)
    pub(crate) fn remote_close(&self, reset: bool) {
        let mut inner = self.lock();
        if inner.state == PipeState::Closed {
            return;
        }

        let closed_now = if reset {
            if inner.open_result.is_none() {
                inner.open_result = Some(Err(PipeError::Rejected));
            }
            inner.failure.get_or_insert(PipeError::Reset);
            inner.state = PipeState::Closed;
            inner.queue.clear();
            inner.buffered = 0;
            true
        } else {
            Self::mark_opened(&mut inner);
            inner.remote_fin = true;
            Self::settle(&mut inner)
        };
        drop(inner);

        self.notify_all();
        if closed_now {
            self.remove_from_table();
        }
    }

    /// Fail the pipe without sending anything (the session is gone)
    pub(crate) fn abort(&self, error: PipeError) {
        let mut inner = self.lock();
        if inner.state == PipeState::Closed {
            return;
        }
        if inner.open_result.is_none() {
            inner.open_result = Some(Err(error.clone()));
        }
        inner.failure.get_or_insert(error);
        inner.state = PipeState::Closed;
        inner.queue.clear();
        inner.buffered = 0;
        drop(inner);

        self.notify_all();
    }

    /// Abort the pipe locally and tell the peer
    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        if inner.state == PipeState::Closed {
            return;
        }
        if inner.open_result.is_none() {
            inner.open_result = Some(Err(PipeError::Closed));
        }
        inner.local_fin = true;
        inner.state = PipeState::Closed;
        inner.queue.clear();
        inner.buffered = 0;
        drop(inner);

        self.notify_all();
        self.sink.enqueue(Frame::pipe_reset(self.id));
        self.remove_from_table();
    }

    fn try_read(&self, batch: bool) -> Option<Result<Option<Vec<Bytes>>, PipeError>> {
        let mut inner = self.lock();

        if !inner.queue.is_empty() {
            let mut chunks = Vec::new();
            let mut consumed = 0usize;
            while let Some(chunk) = inner.queue.pop_front() {
                consumed += chunk.len();
                chunks.push(chunk);
                if !batch {
                    break;
                }
            }
            inner.buffered -= consumed;
            inner.consumed_ungranted += consumed as u64;

            let grant = Self::take_grant(&mut inner, self.grant_threshold());
            let closed_now = Self::settle(&mut inner);
            drop(inner);

            self.send_grant(grant);
            if closed_now {
                self.notify_all();
                self.remove_from_table();
            }
            return Some(Ok(Some(chunks)));
        }

        if let Some(failure) = &inner.failure {
            return Some(Err(failure.clone()));
        }
        if inner.remote_fin || inner.state == PipeState::Closed {
            return Some(Ok(None));
        }
        None
    }

    async fn read_inner(
        &self,
        batch: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<Bytes>>, PipeError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_read(batch) {
                return result;
            }

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(PipeError::Cancelled),
                    _ = &mut notified => {}
                },
                None => notified.await,
            }
        }
    }

    fn check_writable(inner: &PipeInner) -> Result<(), PipeError> {
        if let Some(failure) = &inner.failure {
            return Err(match failure {
                PipeError::ConnectionAborted => PipeError::ConnectionAborted,
                _ => PipeError::Closed,
            });
        }
        if inner.local_fin || inner.state == PipeState::Closed {
            return Err(PipeError::Closed);
        }
        Ok(())
    }

    /// Take up to `wanted` bytes of send credit, waiting while none is left
    async fn reserve(
        &self,
        wanted: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, PipeError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                Self::check_writable(&inner)?;
                if inner.send_credit > 0 {
                    let amount = (wanted as u64)
                        .min(inner.send_credit)
                        .min(self.params.max_chunk as u64) as usize;
                    inner.send_credit -= amount as u64;
                    return Ok(amount);
                }
            }

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(PipeError::Cancelled),
                    _ = &mut notified => {}
                },
                None => notified.await,
            }
        }
    }

    async fn write_inner(
        &self,
        mut data: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError> {
        if data.is_empty() {
            return Self::check_writable(&self.lock());
        }

        while !data.is_empty() {
            let amount = self.reserve(data.len(), cancel).await?;
            let chunk = data.split_to(amount);
            // Credit taken above is not refunded if this send is abandoned
            self.sink
                .send(Frame::pipe_data(self.id, chunk))
                .await
                .map_err(|_| PipeError::ConnectionAborted)?;
        }
        Ok(())
    }

    /// Complete the write half (FIN)
    pub(crate) async fn complete_write(&self) -> Result<(), PipeError> {
        {
            let mut inner = self.lock();
            if inner.local_fin || inner.state == PipeState::Closed {
                return Ok(());
            }
            inner.local_fin = true;
        }

        let sent = self.sink.send(Frame::pipe_fin(self.id)).await;

        let closed_now = Self::settle(&mut self.lock());
        self.notify_all();
        if closed_now {
            self.remove_from_table();
        }

        sent.map_err(|_| PipeError::ConnectionAborted)
    }

    /// The reader went away: discard buffered data and keep crediting the peer
    pub(crate) fn detach_reader(&self) {
        let mut inner = self.lock();
        if inner.reader_detached {
            return;
        }
        inner.reader_detached = true;
        let discarded = inner.buffered as u64;
        inner.queue.clear();
        inner.buffered = 0;
        inner.consumed_ungranted += discarded;

        let grant = Self::take_grant(&mut inner, 1);
        let closed_now = Self::settle(&mut inner);
        drop(inner);

        self.send_grant(grant);
        if closed_now {
            self.notify_all();
            self.remove_from_table();
        }
    }

    /// Complete both halves on behalf of a handler that returned
    pub(crate) async fn finish(&self) {
        if let Err(e) = self.complete_write().await {
            debug!(pipe_id = self.id, "Pipe completion failed: {}", e);
        }
        self.detach_reader();
    }
}

/// Read half of a pipe
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    pub fn id(&self) -> PipeId {
        self.shared.id()
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    /// Bytes received but not yet read
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    /// Negotiated flow-control window of this pipe
    pub fn window(&self) -> u32 {
        self.shared.window()
    }

    /// Next received chunk, or `None` once the peer completed its write half
    pub async fn read(&mut self) -> Result<Option<Bytes>, PipeError> {
        Ok(self
            .shared
            .read_inner(false, None)
            .await?
            .and_then(|mut chunks| chunks.pop()))
    }

    pub async fn read_cancellable(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, PipeError> {
        Ok(self
            .shared
            .read_inner(false, Some(cancel))
            .await?
            .and_then(|mut chunks| chunks.pop()))
    }

    /// Every chunk currently buffered, waiting for at least one
    pub async fn read_batch(&mut self) -> Result<Option<Vec<Bytes>>, PipeError> {
        self.shared.read_inner(true, None).await
    }

    /// Deliver batches to `on_batch` until the peer completes; returns the byte count
    pub async fn read_until_complete<F>(&mut self, mut on_batch: F) -> Result<u64, PipeError>
    where
        F: FnMut(Vec<Bytes>),
    {
        let mut total = 0u64;
        while let Some(batch) = self.read_batch().await? {
            total += batch.iter().map(|chunk| chunk.len() as u64).sum::<u64>();
            on_batch(batch);
        }
        Ok(total)
    }

    /// Abort the pipe in both directions
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Collect everything until the peer completes
    pub async fn read_to_end(&mut self) -> Result<Bytes, PipeError> {
        let mut out = BytesMut::new();
        self.read_until_complete(|batch| {
            for chunk in batch {
                out.extend_from_slice(&chunk);
            }
        })
        .await?;
        Ok(out.freeze())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.detach_reader();
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Write half of a pipe
///
/// Dropping the writer without calling [`PipeWriter::complete`] completes it
/// in the background.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    pub fn id(&self) -> PipeId {
        self.shared.id()
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    /// Send credit currently available
    pub fn available_credit(&self) -> u64 {
        self.shared.send_credit()
    }

    /// Negotiated flow-control window of this pipe
    pub fn window(&self) -> u32 {
        self.shared.window()
    }

    /// Write all of `data`, splitting it into frames and waiting for credit
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), PipeError> {
        self.shared.write_inner(data.into(), None).await
    }

    /// Like [`PipeWriter::write`], giving up with `Cancelled` while waiting for credit
    pub async fn write_cancellable(
        &mut self,
        data: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<(), PipeError> {
        self.shared.write_inner(data.into(), Some(cancel)).await
    }

    /// Signal that no more data will be written
    pub async fn complete(&mut self) -> Result<(), PipeError> {
        self.shared.complete_write().await
    }

    /// Abort the pipe in both directions
    pub fn reset(&self) {
        self.shared.reset();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.shared.is_write_complete() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move {
                if let Err(e) = shared.complete_write().await {
                    debug!(pipe_id = shared.id(), "Background pipe completion failed: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Bidirectional pipe handle
#[derive(Debug)]
pub struct NexusPipe {
    reader: PipeReader,
    writer: PipeWriter,
}

impl NexusPipe {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
        Self {
            reader: PipeReader {
                shared: shared.clone(),
            },
            writer: PipeWriter { shared },
        }
    }

    pub(crate) fn shared(&self) -> Arc<PipeShared> {
        self.writer.shared.clone()
    }

    pub fn id(&self) -> PipeId {
        self.writer.id()
    }

    pub fn state(&self) -> PipeState {
        self.writer.state()
    }

    pub fn available_credit(&self) -> u64 {
        self.writer.available_credit()
    }

    /// Wait until the peer acknowledged the pipe
    pub async fn ready(&self) -> Result<(), PipeError> {
        self.writer.shared.ready().await
    }

    pub async fn read(&mut self) -> Result<Option<Bytes>, PipeError> {
        self.reader.read().await
    }

    pub async fn read_cancellable(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, PipeError> {
        self.reader.read_cancellable(cancel).await
    }

    pub async fn read_until_complete<F>(&mut self, on_batch: F) -> Result<u64, PipeError>
    where
        F: FnMut(Vec<Bytes>),
    {
        self.reader.read_until_complete(on_batch).await
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, PipeError> {
        self.reader.read_to_end().await
    }

    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), PipeError> {
        self.writer.write(data).await
    }

    pub async fn write_cancellable(
        &mut self,
        data: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<(), PipeError> {
        self.writer.write_cancellable(data, cancel).await
    }

    pub async fn complete(&mut self) -> Result<(), PipeError> {
        self.writer.complete().await
    }

    pub fn reset(&self) {
        self.writer.reset();
    }

    pub fn split(self) -> (PipeReader, PipeWriter) {
        (self.reader, self.writer)
    }
}
