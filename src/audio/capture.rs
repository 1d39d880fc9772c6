//! Audio capture module using cpal.
//!
//! Captures audio from an input device in the configured format and hands it
//! out as fixed-size frames through [`FrameSource`]. The cpal callback pushes
//! into a lock-free ring buffer so it never blocks; the capture loop pulls
//! complete frames from the other end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tracing::{debug, error, info, warn};

use super::util::{find_input_device, find_matching_config, get_device_name};
use crate::codec::{Frame, Sample, SampleFormat};
use crate::error::CaptureError;
use crate::relay::FrameSource;

/// How often the reader polls the ring buffer while waiting for samples.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Minimum ring buffer size in samples.
const MIN_RING_SIZE: usize = 65536;

/// Ring buffer size as a multiple of one frame.
const RING_FRAMES: usize = 32;

/// Parameters of the capture stream, fixed at startup.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Input device name; the default input device when `None`
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Samples per channel in one frame
    pub frame_size: usize,
    /// Maximum time without any samples before the device is considered gone
    pub stall_timeout: Duration,
}

impl CaptureSettings {
    fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }
}

/// A running cpal input stream that yields fixed-size frames.
pub struct InputCapture<T> {
    _stream: Stream,                          // Kept alive while capturing
    consumer: ringbuf::HeapCons<T>,           // Ring buffer consumer
    stream_error: Arc<Mutex<Option<String>>>, // Set by the cpal error callback
    samples_per_frame: usize,
    stall_timeout: Duration,
}

impl<T> InputCapture<T>
where
    T: Sample + SizedSample,
{
    fn open(device: &Device, config: &StreamConfig, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let samples_per_frame = settings.samples_per_frame();
        let ring = HeapRb::<T>::new((samples_per_frame * RING_FRAMES).max(MIN_RING_SIZE));
        let (mut producer, consumer) = ring.split();

        let stream_error = Arc::new(Mutex::new(None));
        let error_slot = stream_error.clone();
        let overruns = Arc::new(AtomicU64::new(0));
        let channels = settings.channels as usize;

        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // Lock-free, non-blocking
                    let written = push_whole_groups(&mut producer, data, channels);
                    if written < data.len() {
                        let count = overruns.fetch_add(1, Ordering::Relaxed);
                        if count.is_multiple_of(100) {
                            warn!("Capture ring buffer full, dropped {} audio chunk(s)", count + 1);
                        }
                    }
                },
                move |err| {
                    error!("Audio capture error: {}", err);
                    error_slot.lock().get_or_insert_with(|| err.to_string());
                },
                None,
            )
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        stream.play().map_err(|e| CaptureError::Open(e.to_string()))?;

        Ok(Self { _stream: stream, consumer, stream_error, samples_per_frame, stall_timeout: settings.stall_timeout })
    }
}

/// Push as many complete interleaved sample groups as fit.
///
/// A partial group would shift every later sample into the wrong channel,
/// so the tail of `data` that doesn't fit is dropped at a group boundary.
fn push_whole_groups<T, P>(producer: &mut P, data: &[T], channels: usize) -> usize
where
    T: Copy,
    P: Producer<Item = T>,
{
    let fits = producer.vacant_len().min(data.len());
    let whole = fits - fits % channels.max(1);
    producer.push_slice(&data[..whole])
}

impl<T> FrameSource for InputCapture<T>
where
    T: Sample + SizedSample,
{
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut buffer = vec![T::default(); self.samples_per_frame];
        let mut filled = 0;
        let mut last_progress = Instant::now();

        while filled < buffer.len() {
            if let Some(err) = self.stream_error.lock().take() {
                return Err(CaptureError::Stream(err));
            }

            let read = self.consumer.pop_slice(&mut buffer[filled..]);
            if read > 0 {
                filled += read;
                last_progress = Instant::now();
                continue;
            }

            if last_progress.elapsed() >= self.stall_timeout {
                return Err(CaptureError::Stalled(self.stall_timeout.as_millis() as u64));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        Ok(T::into_frame(buffer))
    }
}

/// Open the configured input device and start streaming.
///
/// Must be called on the thread that will pull frames: the returned stream
/// is not `Send` on every platform.
///
/// # Errors
/// Returns an error if:
/// - The named device does not exist, or there is no default input
/// - The device cannot provide the requested rate, channels and format
/// - The stream cannot be built or started
pub fn open_input(settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, CaptureError> {
    let host = cpal::default_host();
    let device = find_input_device(&host, settings.device.as_deref())?;

    info!("Using input device: {}", get_device_name(&device));

    let supported = device.supported_input_configs().map_err(|e| CaptureError::Enumerate(e.to_string()))?;
    let config = find_matching_config(supported, settings.sample_rate, settings.channels, settings.format).ok_or(
        CaptureError::UnsupportedConfig { sample_rate: settings.sample_rate, channels: settings.channels, format: settings.format },
    )?;

    debug!("Audio capture config: {} Hz, {} channels, {:?}", config.sample_rate(), config.channels(), config.sample_format());

    let stream_config: StreamConfig = config.config();

    let source: Box<dyn FrameSource> = match settings.format {
        SampleFormat::I16 => Box::new(InputCapture::<i16>::open(&device, &stream_config, settings)?),
        SampleFormat::I32 => Box::new(InputCapture::<i32>::open(&device, &stream_config, settings)?),
        SampleFormat::F32 => Box::new(InputCapture::<f32>::open(&device, &stream_config, settings)?),
    };

    info!(
        "Audio capture started: {} Hz, {} channel(s), {}, {} samples per frame",
        settings.sample_rate, settings.channels, settings.format, settings.frame_size
    );

    Ok(source)
}
