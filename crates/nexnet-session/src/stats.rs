//! Per-session counters

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pipes_opened: AtomicU64,
    pipes_accepted: AtomicU64,
    invocations_sent: AtomicU64,
    invocations_received: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pipes_opened: u64,
    pub pipes_accepted: u64,
    pub invocations_sent: u64,
    pub invocations_received: u64,
}

impl SessionStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_pipe_opened(&self) {
        self.pipes_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pipe_accepted(&self) {
        self.pipes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation_sent(&self) {
        self.invocations_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation_received(&self) {
        self.invocations_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            pipes_opened: self.pipes_opened.load(Ordering::Relaxed),
            pipes_accepted: self.pipes_accepted.load(Ordering::Relaxed),
            invocations_sent: self.invocations_sent.load(Ordering::Relaxed),
            invocations_received: self.invocations_received.load(Ordering::Relaxed),
        }
    }
}
