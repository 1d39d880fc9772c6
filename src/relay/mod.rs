//! The producer/fan-out pipeline.
//!
//! ```text
//! FrameSource -> CaptureLoop -> frame_channel -> Broadcaster -> {Subscriber..}
//!                                                    ^
//!                              SubscriberRegistry ---+--- connection tasks
//! ```
//!
//! The capture loop owns a dedicated OS thread; the broadcaster and the
//! connection tasks run on the tokio runtime.

mod broadcaster;
mod capture;
mod channel;
mod registry;
mod shutdown;
mod stats;
mod subscriber;

pub use broadcaster::Broadcaster;
pub use capture::{CaptureLoop, FrameSource, start_capture};
pub use channel::{FrameReceiver, OverflowPolicy, frame_channel};
pub use registry::SubscriberRegistry;
pub use shutdown::teardown;
pub use stats::{RelayStats, StatsSnapshot};
pub use subscriber::{FrameSink, Subscriber};
