//! Error types for the capture, codec, channel and delivery boundaries.
//!
//! Startup and glue code uses `anyhow`; the relay core reports these typed
//! errors so callers can tell fatal capture faults from per-subscriber ones.

use thiserror::Error;

use crate::codec::SampleFormat;

/// Errors raised while opening or reading the capture device.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to enumerate input devices: {0}")]
    Enumerate(String),

    #[error("Device does not support {channels} channel(s) of {format} at {sample_rate} Hz")]
    UnsupportedConfig { sample_rate: u32, channels: u16, format: SampleFormat },

    #[error("Failed to open input stream: {0}")]
    Open(String),

    #[error("Input stream error: {0}")]
    Stream(String),

    #[error("No audio received for {0} ms")]
    Stalled(u64),
}

/// Errors raised by the frame codec.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame has {actual} samples, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Frame carries {actual} samples, codec expects {expected}")]
    FormatMismatch { expected: SampleFormat, actual: SampleFormat },
}

/// The other end of the distribution channel has gone away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Distribution channel closed")]
pub struct ChannelClosed;

/// A write to a subscriber failed; the subscriber is considered dead.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Write timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Fatal outcome of the capture loop.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),
}
