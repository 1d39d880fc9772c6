//! Pipeline counters shared between the capture thread, the broadcaster and
//! the status endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters for the relay pipeline.
#[derive(Debug, Default)]
pub struct RelayStats {
    frames_enqueued: AtomicU64,
    frames_dropped: AtomicU64,
    frames_broadcast: AtomicU64,
    subscribers_removed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_enqueued: u64,
    pub frames_dropped: u64,
    pub frames_broadcast: u64,
    pub subscribers_removed: u64,
}

impl RelayStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record_enqueued(&self) {
        self.frames_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total of dropped frames.
    pub(crate) fn record_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_broadcast(&self) {
        self.frames_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed(&self, count: u64) {
        self.subscribers_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_enqueued: self.frames_enqueued.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            subscribers_removed: self.subscribers_removed.load(Ordering::Relaxed),
        }
    }
}
