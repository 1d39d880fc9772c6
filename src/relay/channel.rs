//! Bounded single-producer/single-consumer queue between the capture thread
//! and the broadcaster task.
//!
//! The producer side is blocking (it runs on the dedicated capture thread),
//! the consumer side is async. What happens when the queue is full is an
//! explicit [`OverflowPolicy`].

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use clap::ValueEnum;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use super::stats::RelayStats;
use crate::error::ChannelClosed;

/// What the producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Stall the capture loop until the broadcaster catches up (no frame loss)
    #[default]
    Block,
    /// Evict the oldest queued frame to make room (bounded capture latency)
    DropOldest,
}

struct State {
    queue: VecDeque<Bytes>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    stats: Arc<RelayStats>,
}

impl Shared {
    fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_one();
    }
}

/// Producer half, owned by the capture loop.
pub struct FrameSender {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the broadcaster.
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

/// Create a distribution channel holding at most `capacity` frames (minimum 1).
pub fn frame_channel(capacity: usize, policy: OverflowPolicy, stats: Arc<RelayStats>) -> (FrameSender, FrameReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State { queue: VecDeque::with_capacity(capacity), closed: false }),
        not_full: Condvar::new(),
        not_empty: Notify::new(),
        capacity,
        policy,
        stats,
    });

    (FrameSender { shared: shared.clone() }, FrameReceiver { shared })
}

impl FrameSender {
    /// Enqueue a frame, blocking the calling thread while the queue is full
    /// under [`OverflowPolicy::Block`].
    ///
    /// # Errors
    /// Returns [`ChannelClosed`] once the receiver has been dropped.
    pub fn send(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        let mut state = self.shared.state.lock();

        loop {
            if state.closed {
                return Err(ChannelClosed);
            }
            if state.queue.len() < self.shared.capacity {
                break;
            }
            match self.shared.policy {
                OverflowPolicy::Block => self.shared.not_full.wait(&mut state),
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                    let dropped = self.shared.stats.record_dropped();
                    if dropped == 1 || dropped.is_multiple_of(100) {
                        warn!("Broadcaster lagging, dropped {} frame(s) so far", dropped);
                    }
                    break;
                }
            }
        }

        state.queue.push_back(frame);
        drop(state);

        self.shared.stats.record_enqueued();
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl FrameReceiver {
    /// Wait for the next frame in FIFO order.
    ///
    /// Returns `None` once the sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            // Register interest before checking so a push in between is not missed
            let notified = self.shared.not_empty.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(frame) = state.queue.pop_front() {
                    drop(state);
                    self.shared.not_full.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next frame without waiting.
    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Bytes> {
        let frame = self.shared.state.lock().queue.pop_front();
        if frame.is_some() {
            self.shared.not_full.notify_one();
        }
        frame
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
