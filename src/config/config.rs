//! Application configuration and CLI argument parsing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audio::CaptureSettings;
use crate::audio::util::print_input_devices;
use crate::codec::{FrameCodec, SampleFormat};
use crate::relay::OverflowPolicy;

/// Live audio relay configuration. Everything is fixed at process start.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "audio-relay")]
#[command(author, version, about = "Relay live microphone audio to WebSocket subscribers", long_about = None)]
pub struct AppConfig {
    /// List available input devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Input device name (see --list-devices); uses the default input device if omitted
    #[arg(long, short = 'd', env = "RELAY_DEVICE")]
    pub device: Option<String>,

    /// Capture sample rate in Hz
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Samples per channel in each frame (one WebSocket message per frame)
    #[arg(long, default_value = "1024")]
    pub frame_size: usize,

    /// Number of interleaved channels
    #[arg(long, short = 'c', default_value = "1")]
    pub channels: u16,

    /// Sample format of captured and transmitted audio
    #[arg(long, value_enum, default_value = "i16")]
    pub sample_format: SampleFormat,

    /// Address to listen on
    #[arg(long, env = "RELAY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', env = "RELAY_PORT", default_value = "5555")]
    pub port: u16,

    /// HTTP path that accepts WebSocket upgrades
    #[arg(long, default_value = "/channel")]
    pub path: String,

    /// Frames buffered between capture and broadcast
    #[arg(long, default_value = "8")]
    pub queue_capacity: usize,

    /// What to do when the queue is full: 'block' stalls capture, 'drop-oldest' discards queued audio
    #[arg(long, value_enum, default_value = "block")]
    pub overflow: OverflowPolicy,

    /// Per-subscriber write deadline in milliseconds; slower subscribers are disconnected
    #[arg(long, default_value = "250")]
    pub write_timeout_ms: u64,

    /// Milliseconds without audio from the device before capture is considered failed
    #[arg(long, default_value = "2000")]
    pub stall_timeout_ms: u64,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        let config = Self::parse();

        if config.list_devices {
            match print_input_devices() {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Socket address the server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.sample_format, self.frame_size, self.channels)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            device: self.device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.sample_format,
            frame_size: self.frame_size,
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            anyhow::bail!("Sample rate must be positive");
        }

        if self.frame_size == 0 {
            anyhow::bail!("Frame size must be positive");
        }

        if self.channels == 0 {
            anyhow::bail!("Channel count must be positive");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be at least 1");
        }

        if self.write_timeout_ms == 0 {
            anyhow::bail!("Write timeout must be positive");
        }

        if self.stall_timeout_ms == 0 {
            anyhow::bail!("Stall timeout must be positive");
        }

        if !self.path.starts_with('/') {
            anyhow::bail!("Path must start with '/': {}", self.path);
        }

        if self.path == "/status" {
            anyhow::bail!("Path '/status' is reserved for the status endpoint");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        let codec = self.codec();
        info!("Configuration:");
        info!("  Device: {}", self.device.as_deref().unwrap_or("(default input)"));
        info!("  Sample rate: {} Hz", self.sample_rate);
        info!("  Channels: {}", self.channels);
        info!("  Sample format: {}", self.sample_format);
        info!("  Frame: {} samples, {} bytes, {:?}", self.frame_size, codec.encoded_len(), codec.frame_interval(self.sample_rate));
        info!("  Queue: {} frame(s), overflow {:?}", self.queue_capacity, self.overflow);
        info!("  Write timeout: {}ms", self.write_timeout_ms);
        info!("  Endpoint: ws://{}{}", self.listen_addr(), self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppConfig {
        AppConfig::try_parse_from(std::iter::once("audio-relay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_stream_contract() {
        let config = parse(&[]);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.frame_size, 1024);
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_format, SampleFormat::I16);
        assert_eq!(config.port, 5555);
        assert_eq!(config.path, "/channel");
        assert_eq!(config.overflow, OverflowPolicy::Block);
        assert_eq!(config.codec().encoded_len(), 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_overrides() {
        let config = parse(&["--sample-format", "f32", "--channels", "2", "--overflow", "drop-oldest", "--port", "9000"]);
        assert_eq!(config.sample_format, SampleFormat::F32);
        assert_eq!(config.channels, 2);
        assert_eq!(config.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.listen_addr().port(), 9000);
        assert_eq!(config.codec().encoded_len(), 1024 * 2 * 4);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--frame-size", "0"]).validate().is_err());
        assert!(parse(&["--channels", "0"]).validate().is_err());
        assert!(parse(&["--queue-capacity", "0"]).validate().is_err());
        assert!(parse(&["--path", "channel"]).validate().is_err());
        assert!(parse(&["--path", "/status"]).validate().is_err());
    }
}
