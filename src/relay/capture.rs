//! The capture loop: pull a frame, encode it, enqueue it.
//!
//! Runs on its own OS thread for the lifetime of the process. The source is
//! opened on that thread because audio streams are generally not `Send`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::channel::FrameSender;
use crate::codec::{Frame, FrameCodec};
use crate::error::{CaptureError, RelayError};

/// Pull interface over the capture device.
pub trait FrameSource {
    /// Block until the next full frame is available.
    ///
    /// Any error is unrecoverable for the relay.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }
}

/// Producer side of the pipeline.
pub struct CaptureLoop {
    codec: FrameCodec,
    sender: FrameSender,
    shutdown: Arc<AtomicBool>,
    on_failure: Option<CancellationToken>,
}

impl CaptureLoop {
    pub fn new(codec: FrameCodec, sender: FrameSender, shutdown: Arc<AtomicBool>) -> Self {
        Self { codec, sender, shutdown, on_failure: None }
    }

    /// Cancel `token` the moment the loop fails, before the channel closes.
    ///
    /// Frames still queued at that point are not delivered.
    pub fn cancel_on_failure(mut self, token: CancellationToken) -> Self {
        self.on_failure = Some(token);
        self
    }

    /// Capture until shutdown is requested or the broadcaster goes away.
    ///
    /// Returns the number of frames enqueued on a clean stop.
    ///
    /// # Errors
    /// A source read error or an encoding error ends the loop and is returned
    /// as-is; the channel is closed on return so nothing further is enqueued.
    pub fn run<F: FrameSource + ?Sized>(self, source: &mut F) -> Result<u64, RelayError> {
        let result = self.pump(source);
        if result.is_err()
            && let Some(token) = &self.on_failure
        {
            token.cancel();
        }
        result
    }

    fn pump<F: FrameSource + ?Sized>(&self, source: &mut F) -> Result<u64, RelayError> {
        let mut captured = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            let frame = source.next_frame()?;
            let encoded = self.codec.encode(&frame)?;

            trace!(
                "📦 Frame {}: {} bytes, head {:?}, queue {}/{}",
                captured,
                encoded.len(),
                &encoded[..encoded.len().min(5)],
                self.sender.len(),
                self.sender.capacity()
            );

            if self.sender.send(encoded).is_err() {
                debug!("Distribution channel closed, capture loop exiting");
                break;
            }
            captured += 1;
        }

        Ok(captured)
    }
}

/// A running capture thread.
pub struct CaptureHandle {
    done: oneshot::Receiver<Result<u64, RelayError>>,
}

impl CaptureHandle {
    /// Wait for the capture loop to end and return its outcome.
    pub async fn finished(&mut self) -> Result<u64, RelayError> {
        match (&mut self.done).await {
            Ok(result) => result,
            // The thread died without reporting (panic in the source)
            Err(_) => Err(RelayError::Capture(CaptureError::Stream("capture thread terminated".to_string()))),
        }
    }
}

/// Spawn the capture thread and wait until the source has been opened.
///
/// # Arguments
/// * `open` - Opens the capture source on the capture thread
/// * `capture` - The loop to run once the source is open
///
/// # Errors
/// Returns the source's open error (e.g. device not found) before any frame
/// is produced, or an error if the thread could not be spawned.
pub async fn start_capture<F, S>(open: F, capture: CaptureLoop) -> Result<CaptureHandle>
where
    F: FnOnce() -> Result<S, CaptureError> + Send + 'static,
    S: FrameSource + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            let mut source = match open() {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            info!("🎙️ Capturing audio...");
            let result = capture.run(&mut source);
            let _ = done_tx.send(result);
            debug!("Capture thread exiting");
        })
        .context("Failed to spawn capture thread")?;

    ready_rx.await.context("Capture thread exited during startup")??;

    Ok(CaptureHandle { done: done_rx })
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::super::channel::{OverflowPolicy, frame_channel};
    use super::super::stats::RelayStats;
    use super::testing::ScriptedSource;
    use super::*;
    use crate::codec::SampleFormat;

    fn codec() -> FrameCodec {
        FrameCodec::new(SampleFormat::I16, 4, 1)
    }

    #[test]
    fn test_frame_encoded_and_enqueued() {
        let (tx, mut rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));
        let mut source = ScriptedSource::new([Ok(Frame::I16(vec![1, 2, 3, 4])), Err(CaptureError::Stream("unplugged".to_string()))]);

        let result = capture.run(&mut source);
        assert!(matches!(result, Err(RelayError::Capture(CaptureError::Stream(_)))));

        assert_eq!(rx.try_recv(), Some(Bytes::from_static(&[1, 0, 2, 0, 3, 0, 4, 0])));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_fatal_error_closes_channel() {
        let (tx, mut rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));
        let mut source = ScriptedSource::new([
            Ok(Frame::I16(vec![1, 1, 1, 1])),
            Err(CaptureError::Stream("device reset".to_string())),
            Ok(Frame::I16(vec![2, 2, 2, 2])),
        ]);

        assert!(capture.run(&mut source).is_err());
        assert!(rx.recv().await.is_some());
        assert_eq!(rx.recv().await, None);
        // The frame after the failure is never pulled
        assert_eq!(source.script.len(), 1);
    }

    #[test]
    fn test_encoding_error_is_fatal() {
        let (tx, mut rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));
        let mut source = ScriptedSource::new([Ok(Frame::I16(vec![1, 2, 3]))]);

        assert!(matches!(capture.run(&mut source), Err(RelayError::Codec(_))));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_shutdown_flag_stops_loop() {
        let (tx, _rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(true)));
        let mut source = ScriptedSource::new([Ok(Frame::I16(vec![1, 2, 3, 4]))]);

        assert_eq!(capture.run(&mut source).unwrap(), 0);
        assert_eq!(source.script.len(), 1);
    }

    #[test]
    fn test_closed_channel_stops_loop_cleanly() {
        let (tx, rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        drop(rx);
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));
        let mut source = ScriptedSource::new([Ok(Frame::I16(vec![1, 2, 3, 4]))]);

        assert_eq!(capture.run(&mut source).unwrap(), 0);
    }

    #[test]
    fn test_failure_token_only_cancelled_on_error() {
        let (tx, _rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let token = CancellationToken::new();
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(true))).cancel_on_failure(token.clone());
        capture.run(&mut ScriptedSource::new([])).unwrap();
        assert!(!token.is_cancelled());

        let (tx, _rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false))).cancel_on_failure(token.clone());
        assert!(capture.run(&mut ScriptedSource::new([])).is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_capture_reports_open_error() {
        let (tx, _rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));

        let result = start_capture(|| Err::<ScriptedSource, _>(CaptureError::DeviceNotFound("USB Mic".to_string())), capture).await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("USB Mic"));
    }

    #[tokio::test]
    async fn test_start_capture_runs_until_source_fails() {
        let (tx, mut rx) = frame_channel(4, OverflowPolicy::Block, RelayStats::shared());
        let capture = CaptureLoop::new(codec(), tx, Arc::new(AtomicBool::new(false)));

        let mut handle = start_capture(|| Ok(ScriptedSource::new([Ok(Frame::I16(vec![5, 6, 7, 8]))])), capture).await.unwrap();

        assert!(matches!(handle.finished().await, Err(RelayError::Capture(CaptureError::Stalled(_)))));
        assert_eq!(rx.recv().await, Some(Bytes::from_static(&[5, 0, 6, 0, 7, 0, 8, 0])));
        assert_eq!(rx.recv().await, None);
    }
}
