//! Pipe id allocation and routing of pipe frames to their pipes

use crate::error::PipeError;
use crate::pipe::{DataOutcome, NexusPipe, PipeParams, PipeShared, PipeTable};
use crate::sink::FrameSink;
use crate::stats::SessionStats;
use bytes::Bytes;
use dashmap::DashMap;
use nexnet_proto::{Frame, PipeId, Role};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owns every pipe of one session
///
/// The initiator allocates odd ids starting at 1 and the acceptor even ids
/// starting at 2. Ids are never reused within a session, so late frames for a
/// closed pipe can be dropped without ambiguity.
pub(crate) struct PipeManager {
    role: Role,
    next_id: AtomicU32,
    table: Arc<PipeTable>,
    /// Pipes opened by the peer and not yet claimed by an invocation
    incoming: DashMap<PipeId, NexusPipe>,
    sink: Arc<FrameSink>,
    params: PipeParams,
    max_pipes: usize,
    stats: Arc<SessionStats>,
    closed: AtomicBool,
}

impl PipeManager {
    pub(crate) fn new(
        role: Role,
        sink: Arc<FrameSink>,
        params: PipeParams,
        max_pipes: usize,
        stats: Arc<SessionStats>,
    ) -> Self {
        let first_id = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };

        Self {
            role,
            next_id: AtomicU32::new(first_id),
            table: Arc::new(PipeTable::new()),
            incoming: DashMap::new(),
            sink,
            params,
            max_pipes,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    fn lookup(&self, id: PipeId) -> Option<Arc<PipeShared>> {
        self.table.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether `id` has the parity the peer allocates from
    fn is_peer_id(&self, id: PipeId) -> bool {
        let peer_is_initiator = self.role.opposite() == Role::Initiator;
        id != 0 && (id % 2 == 1) == peer_is_initiator
    }

    pub(crate) fn active_count(&self) -> usize {
        self.table.len()
    }

    /// Allocate a fresh id and send Pipe-Open
    pub(crate) async fn open_pipe(&self) -> Result<NexusPipe, PipeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipeError::ConnectionAborted);
        }
        if self.table.len() >= self.max_pipes {
            return Err(PipeError::TooManyPipes {
                limit: self.max_pipes,
            });
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let shared = PipeShared::new(
            id,
            true,
            self.sink.clone(),
            Arc::downgrade(&self.table),
            self.params,
        );
        self.table.insert(id, shared.clone());

        // abort_all may have swept the table between the check above and the insert
        if self.closed.load(Ordering::Acquire) {
            self.table.remove(&id);
            shared.abort(PipeError::ConnectionAborted);
            return Err(PipeError::ConnectionAborted);
        }

        if self.sink.send(Frame::pipe_open(id)).await.is_err() {
            self.table.remove(&id);
            shared.abort(PipeError::ConnectionAborted);
            return Err(PipeError::ConnectionAborted);
        }

        self.stats.record_pipe_opened();
        debug!(pipe_id = id, "Pipe opened");
        Ok(NexusPipe::new(shared))
    }

    /// Peer opened a pipe: acknowledge it, or reject it with RST
    pub(crate) fn accept_incoming(&self, id: PipeId) {
        if !self.is_peer_id(id) {
            warn!(pipe_id = id, "Rejecting pipe open with wrong id parity");
            self.sink.enqueue(Frame::pipe_reset(id));
            return;
        }
        if self.table.contains_key(&id) {
            warn!(pipe_id = id, "Rejecting duplicate pipe open");
            self.sink.enqueue(Frame::pipe_reset(id));
            return;
        }
        if self.table.len() >= self.max_pipes {
            warn!(
                pipe_id = id,
                limit = self.max_pipes,
                "Rejecting pipe open, too many pipes"
            );
            self.sink.enqueue(Frame::pipe_reset(id));
            return;
        }

        let shared = PipeShared::new(
            id,
            false,
            self.sink.clone(),
            Arc::downgrade(&self.table),
            self.params,
        );
        self.table.insert(id, shared.clone());
        self.incoming.insert(id, NexusPipe::new(shared));
        self.sink.enqueue(Frame::pipe_open_ack(id));

        self.stats.record_pipe_accepted();
        debug!(pipe_id = id, "Pipe accepted");
    }

    /// Claim a pipe the peer opened, typically because an invocation names it
    pub(crate) fn take_incoming(&self, id: PipeId) -> Option<NexusPipe> {
        self.incoming.remove(&id).map(|(_, pipe)| pipe)
    }

    pub(crate) fn acknowledge(&self, id: PipeId) {
        match self.lookup(id) {
            Some(pipe) => pipe.mark_open(),
            None => debug!(pipe_id = id, "Acknowledgement for unknown pipe"),
        }
    }

    pub(crate) fn route_data(&self, id: PipeId, payload: Bytes) {
        let Some(pipe) = self.lookup(id) else {
            warn!(
                pipe_id = id,
                len = payload.len(),
                "Dropping data for unknown pipe"
            );
            return;
        };

        match pipe.push_data(payload) {
            DataOutcome::Accepted => trace!(pipe_id = id, "Pipe data queued"),
            DataOutcome::Dropped => debug!(pipe_id = id, "Dropping data for completed pipe"),
            DataOutcome::Violation => {
                warn!(pipe_id = id, "Peer exceeded pipe credit, resetting pipe");
                self.incoming.remove(&id);
                self.sink.enqueue(Frame::pipe_reset(id));
            }
        }
    }

    pub(crate) fn apply_credit(&self, id: PipeId, amount: u32) {
        match self.lookup(id) {
            Some(pipe) => pipe.add_credit(amount),
            None => trace!(pipe_id = id, "Credit for unknown pipe"),
        }
    }

    pub(crate) fn remote_close(&self, id: PipeId, reset: bool) {
        if reset {
            self.incoming.remove(&id);
        }
        match self.lookup(id) {
            Some(pipe) => pipe.remote_close(reset),
            None => debug!(pipe_id = id, reset, "Close for unknown pipe"),
        }
    }

    /// Fail every pipe; the session is gone
    pub(crate) fn abort_all(&self) {
        self.closed.store(true, Ordering::Release);

        let pipes: Vec<Arc<PipeShared>> = self
            .table
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.table.clear();

        for pipe in &pipes {
            pipe.abort(PipeError::ConnectionAborted);
        }
        self.incoming.clear();

        if !pipes.is_empty() {
            debug!(count = pipes.len(), "Aborted open pipes");
        }
    }
}
