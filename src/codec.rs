//! Frame encoding.
//!
//! Turns one captured frame into the canonical wire form: samples packed
//! back to back in little-endian order, interleaved by channel, no header.
//! The sample format is fixed at startup and carried by the codec.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Sample width and representation of captured audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 16-bit signed integer
    #[default]
    I16,
    /// 32-bit signed integer
    I32,
    /// 32-bit IEEE float
    F32,
}

impl SampleFormat {
    /// Bytes occupied by one sample on the wire.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::I16 => write!(f, "i16"),
            SampleFormat::I32 => write!(f, "i32"),
            SampleFormat::F32 => write!(f, "f32"),
        }
    }
}

/// One capture cycle worth of interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl Frame {
    pub fn format(&self) -> SampleFormat {
        match self {
            Frame::I16(_) => SampleFormat::I16,
            Frame::I32(_) => SampleFormat::I32,
            Frame::F32(_) => SampleFormat::F32,
        }
    }

    /// Total number of samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            Frame::I16(s) => s.len(),
            Frame::I32(s) => s.len(),
            Frame::F32(s) => s.len(),
        }
    }
}

/// A sample type the relay can capture and encode.
pub trait Sample: Copy + Default + Send + 'static {
    const FORMAT: SampleFormat;

    /// Wrap a buffer of this sample type into a [`Frame`].
    fn into_frame(samples: Vec<Self>) -> Frame;
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;

    fn into_frame(samples: Vec<Self>) -> Frame {
        Frame::I16(samples)
    }
}

impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::I32;

    fn into_frame(samples: Vec<Self>) -> Frame {
        Frame::I32(samples)
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;

    fn into_frame(samples: Vec<Self>) -> Frame {
        Frame::F32(samples)
    }
}

/// Encoder for fixed-size frames of a single sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    format: SampleFormat,
    frame_size: usize,
    channels: u16,
}

impl FrameCodec {
    /// Create a codec for frames of `frame_size` samples per channel.
    pub fn new(format: SampleFormat, frame_size: usize, channels: u16) -> Self {
        Self { format, frame_size, channels }
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Interleaved sample count of one frame.
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    /// Byte length of every encoded frame.
    pub fn encoded_len(&self) -> usize {
        self.samples_per_frame() * self.format.bytes_per_sample()
    }

    /// Wall-clock duration covered by one frame at `sample_rate`.
    pub fn frame_interval(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / sample_rate as f64)
    }

    /// Encode a frame into its little-endian wire form.
    ///
    /// # Errors
    /// Returns an error if the frame's sample format differs from the codec's,
    /// or if it does not hold exactly [`samples_per_frame`](Self::samples_per_frame) samples.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        if frame.format() != self.format {
            return Err(CodecError::FormatMismatch { expected: self.format, actual: frame.format() });
        }

        let expected = self.samples_per_frame();
        if frame.len() != expected {
            return Err(CodecError::LengthMismatch { expected, actual: frame.len() });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match frame {
            Frame::I16(samples) => samples.iter().for_each(|&s| buf.put_i16_le(s)),
            Frame::I32(samples) => samples.iter().for_each(|&s| buf.put_i32_le(s)),
            Frame::F32(samples) => samples.iter().for_each(|&s| buf.put_f32_le(s)),
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_i16_little_endian() {
        let codec = FrameCodec::new(SampleFormat::I16, 4, 1);
        let bytes = codec.encode(&Frame::I16(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(&bytes[..], &[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn test_encode_negative_and_float_samples() {
        let codec = FrameCodec::new(SampleFormat::I16, 2, 1);
        let bytes = codec.encode(&Frame::I16(vec![-1, i16::MIN])).unwrap();
        assert_eq!(&bytes[..], &[0xff, 0xff, 0x00, 0x80]);

        let codec = FrameCodec::new(SampleFormat::F32, 1, 1);
        let bytes = codec.encode(&Frame::F32(vec![1.0])).unwrap();
        assert_eq!(&bytes[..], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = FrameCodec::new(SampleFormat::I32, 3, 2);
        let frame = Frame::I32(vec![7, -7, 1 << 20, -(1 << 20), 0, i32::MAX]);
        let first = codec.encode(&frame).unwrap();
        let second = codec.encode(&frame).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3 * 2 * 4);
        assert_eq!(first.len(), codec.encoded_len());
    }

    #[test]
    fn test_encode_rejects_wrong_length() {
        let codec = FrameCodec::new(SampleFormat::I16, 4, 2);
        let err = codec.encode(&Frame::I16(vec![1, 2, 3, 4])).unwrap_err();
        assert_eq!(err, CodecError::LengthMismatch { expected: 8, actual: 4 });
    }

    #[test]
    fn test_encode_rejects_wrong_format() {
        let codec = FrameCodec::new(SampleFormat::F32, 1, 1);
        let err = codec.encode(&Frame::I16(vec![1])).unwrap_err();
        assert_eq!(err, CodecError::FormatMismatch { expected: SampleFormat::F32, actual: SampleFormat::I16 });
    }

    #[test]
    fn test_frame_interval() {
        let codec = FrameCodec::new(SampleFormat::I16, 1024, 1);
        let interval = codec.frame_interval(48000);
        assert!((interval.as_secs_f64() - 1024.0 / 48000.0).abs() < 1e-9);
    }
}
