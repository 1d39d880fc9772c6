//! Subscriber handles.
//!
//! A subscriber pairs the write half of a connection with an identity used
//! for registry membership and a token that ends the connection's liveness
//! loop when the subscriber is removed.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::SinkError;

/// Write side of a subscriber connection.
pub trait FrameSink: Send + 'static {
    /// Deliver one encoded frame as a single message.
    fn send_frame(&mut self, frame: Bytes) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Close the connection. Must tolerate an already-broken connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Unique handle identity, assigned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connected peer receiving the broadcast stream.
pub struct Subscriber<S> {
    id: SubscriberId,
    peer: Option<SocketAddr>,
    sink: Mutex<S>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl<S: FrameSink> Subscriber<S> {
    pub fn new(sink: S, peer: Option<SocketAddr>) -> Self {
        Self {
            id: SubscriberId::next(),
            peer,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Token cancelled when the subscriber is closed.
    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one frame.
    pub async fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.sink.lock().await.send_frame(frame).await
    }

    /// Close the connection once; later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.sink.lock().await.close().await;
    }
}

impl<S> fmt::Debug for Subscriber<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).field("peer", &self.peer).finish()
    }
}

impl<S> fmt::Display for Subscriber<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} ({})", self.id, peer),
            None => write!(f, "{}", self.id),
        }
    }
}
