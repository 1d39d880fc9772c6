//! Ordered teardown of the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use super::registry::SubscriberRegistry;
use super::subscriber::FrameSink;

/// Stop capture and fan-out, then close every subscriber.
///
/// The capture thread notices `shutdown` on its next cycle; the broadcaster
/// and the server stop on `cancel` before any subscriber is closed, so no
/// frame is written to a connection that is being torn down.
/// Returns the number of subscribers closed.
pub async fn teardown<S: FrameSink>(shutdown: &AtomicBool, cancel: &CancellationToken, registry: &SubscriberRegistry<S>) -> usize {
    shutdown.store(true, Ordering::SeqCst);
    cancel.cancel();
    registry.close_all().await
}
