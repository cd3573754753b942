//! Pooled buffer segments for incoming frame payloads
//!
//! Segments are fixed-capacity `BytesMut` blocks pulled from an
//! `object-pool` [`Pool`]. A rented segment is written once by the codec and
//! then frozen into a `Bytes` view; the segment goes back to the pool when the
//! last view is dropped. Segments are never mutated after being frozen.

use bytes::{Bytes, BytesMut};
use object_pool::{Pool, ReusableOwned};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Default segment size, matches the default negotiated max frame size
const DEFAULT_SEGMENT_SIZE: usize = crate::DEFAULT_MAX_FRAME_SIZE as usize;

/// Default number of idle segments kept in the pool
const DEFAULT_MAX_RETAINED: usize = 256;

static SHARED_POOL: OnceLock<BufferPool> = OnceLock::new();

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Segments currently rented and not yet returned
    pub outstanding: usize,
    /// Highest `outstanding` value observed
    pub peak_outstanding: usize,
    /// Segments sitting idle in the pool
    pub idle: usize,
    /// Segments ever allocated by this pool
    pub allocated: usize,
}

struct PoolCounters {
    segment_size: usize,
    max_retained: usize,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

/// Bounded pool of fixed-size segments with usage counters
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<BytesMut>>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("segment_size", &self.counters.segment_size)
            .field("max_retained", &self.counters.max_retained)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool with the default segment size and retention
    pub fn new() -> Self {
        Self::with_config(DEFAULT_SEGMENT_SIZE, DEFAULT_MAX_RETAINED)
    }

    /// Create a pool with custom segment size and idle bound
    ///
    /// Segments are allocated lazily on first rent.
    pub fn with_config(segment_size: usize, max_retained: usize) -> Self {
        Self {
            pool: Arc::new(Pool::new(0, BytesMut::new)),
            counters: Arc::new(PoolCounters {
                segment_size,
                max_retained,
                outstanding: AtomicUsize::new(0),
                peak_outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-wide pool, created on first use
    pub fn shared() -> BufferPool {
        SHARED_POOL.get_or_init(BufferPool::new).clone()
    }

    pub fn segment_size(&self) -> usize {
        self.counters.segment_size
    }

    /// Rent an empty segment
    pub fn rent(&self) -> PooledSegment {
        let counters = &self.counters;
        let mut buf = self.pool.pull_owned(|| {
            counters.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(counters.segment_size)
        });
        buf.clear();

        let outstanding = counters.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        counters
            .peak_outstanding
            .fetch_max(outstanding, Ordering::AcqRel);

        PooledSegment {
            buf: Some(buf),
            counters: self.counters.clone(),
        }
    }

    /// Copy `data` into pooled storage and return an immutable view
    ///
    /// Payloads larger than a segment fall back to a plain heap allocation.
    pub fn copy_to_bytes(&self, data: &[u8]) -> Bytes {
        if data.is_empty() {
            return Bytes::new();
        }
        if data.len() > self.counters.segment_size {
            return Bytes::copy_from_slice(data);
        }
        let mut segment = self.rent();
        segment.extend_from_slice(data);
        segment.into_bytes()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.counters.outstanding.load(Ordering::Acquire),
            peak_outstanding: self.counters.peak_outstanding.load(Ordering::Acquire),
            idle: self.pool.len(),
            allocated: self.counters.allocated.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented segment, returned to its pool exactly once on drop
pub struct PooledSegment {
    buf: Option<ReusableOwned<BytesMut>>,
    counters: Arc<PoolCounters>,
}

impl PooledSegment {
    /// Append bytes; callers stay within the segment capacity
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(|b| b.capacity()).unwrap_or(0)
    }

    /// Freeze into a reference-counted view
    ///
    /// The segment returns to the pool once every clone of the returned
    /// `Bytes` has been dropped.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledSegment {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_deref().map(|b| &b[..]).unwrap_or(&[])
    }
}

impl std::fmt::Debug for PooledSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSegment")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledSegment {
    fn drop(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);

        // Detach so resized segments and segments past the idle bound are
        // released instead of reattached
        let (pool, mut segment) = buf.detach();
        if segment.capacity() >= self.counters.segment_size
            && pool.len() < self.counters.max_retained
        {
            segment.clear();
            pool.attach(segment);
        }
    }
}
