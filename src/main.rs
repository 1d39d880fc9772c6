//! Audio Relay - live microphone audio fanned out to WebSocket subscribers.
//!
//! Captures fixed-size PCM frames from one input device and sends every
//! frame, unchanged, as one binary WebSocket message to each connected
//! subscriber.

mod audio;
mod codec;
mod config;
mod error;
mod relay;
mod server;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use audio::open_input;
use config::AppConfig;
use relay::{Broadcaster, CaptureLoop, FrameReceiver, RelayStats, SubscriberRegistry, frame_channel, start_capture, teardown};
use server::{AppState, StreamInfo, WsSink};

/// Spawn the broadcaster task (process lifetime).
///
/// Drains the distribution channel until it closes or `cancel` fires.
fn spawn_broadcaster(broadcaster: Broadcaster<WsSink>, frames: FrameReceiver, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(broadcaster.run(frames, cancel))
}

/// Spawn the HTTP/WebSocket server task (process lifetime).
fn spawn_server(listener: tokio::net::TcpListener, state: AppState, path: &str, cancel: CancellationToken) -> JoinHandle<()> {
    let app = server::router(state, path);
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app, cancel).await {
            error!("❌ {:#}", e);
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }
}

/// Wait for a task with a timeout, logging the outcome.
async fn join_with_timeout(handle: JoinHandle<()>, name: &str, timeout: Duration) {
    tokio::select! {
        _ = handle => {
            debug!("{} task finished gracefully", name);
        }
        _ = tokio::time::sleep(timeout) => {
            debug!("{} task didn't finish in time", name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if config.verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎧 Audio Relay v{}", env!("CARGO_PKG_VERSION"));

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    config.log_config();

    let codec = config.codec();
    let stats = RelayStats::shared();
    let registry = Arc::new(SubscriberRegistry::<WsSink>::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    // Bind first so a busy port fails before the device is opened
    let listener = server::bind(config.listen_addr()).await?;

    let (frame_tx, frame_rx) = frame_channel(config.queue_capacity, config.overflow, stats.clone());

    let broadcaster = Broadcaster::new(registry.clone(), config.write_timeout(), stats.clone()).with_frame_interval(codec.frame_interval(config.sample_rate));
    let broadcaster_handle = spawn_broadcaster(broadcaster, frame_rx, cancel.clone());

    // Open the device on the capture thread; device errors surface here
    let settings = config.capture_settings();
    // A capture failure stops the broadcaster before the error reaches us
    let capture_loop = CaptureLoop::new(codec, frame_tx, shutdown.clone()).cancel_on_failure(cancel.clone());
    let mut capture = match start_capture(move || open_input(&settings), capture_loop).await {
        Ok(capture) => capture,
        Err(e) => {
            cancel.cancel();
            return Err(e.context("Failed to start audio capture"));
        }
    };

    let state = AppState::new(registry.clone(), stats.clone(), StreamInfo::new(&codec, config.sample_rate));
    let server_handle = spawn_server(listener, state, &config.path, cancel.clone());

    info!("Relay running, subscribers connect to ws://{}{}", config.listen_addr(), config.path);

    // Run until a signal arrives or capture ends on its own
    let outcome = tokio::select! {
        _ = wait_for_shutdown() => None,
        result = capture.finished() => Some(result),
    };
    let signalled = outcome.is_none();

    teardown(&shutdown, &cancel, &registry).await;

    let graceful_timeout = Duration::from_millis(500);
    join_with_timeout(broadcaster_handle, "Broadcaster", graceful_timeout).await;
    join_with_timeout(server_handle, "Server", graceful_timeout).await;

    let outcome = match outcome {
        Some(result) => result,
        None => match tokio::time::timeout(graceful_timeout, capture.finished()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Capture thread didn't finish in time");
                Ok(0)
            }
        },
    };

    let stats = stats.snapshot();
    info!(
        "Frames: {} captured, {} broadcast, {} dropped; {} subscriber(s) removed on error",
        stats.frames_enqueued, stats.frames_broadcast, stats.frames_dropped, stats.subscribers_removed
    );

    match outcome {
        Ok(_) => {
            if !signalled {
                warn!("Audio capture stopped without a shutdown request");
            }
            info!("✅ Audio relay stopped");
            Ok(())
        }
        Err(e) => {
            error!("❌ {}", e);
            Err(e).context("Audio capture failed")
        }
    }
}
