//! Audio input.
//!
//! Cross-platform capture with cpal, exposed to the relay as a pull-based
//! [`FrameSource`](crate::relay::FrameSource).

mod capture;
pub mod util;

pub use capture::{CaptureSettings, open_input};
