//! # Relay Web Server
//!
//! HTTP server built on Axum that accepts subscribers and reports status.
//!
//! ## Endpoints
//!
//! | Path | Description |
//! |------|-------------|
//! | `<path>` (default `/channel`) | WebSocket upgrade; one binary message per captured frame |
//! | `/status` | JSON snapshot of subscribers, counters and the stream format |
//!
//! Any origin is accepted. Subscribers never need to send anything; the
//! inbound side of each socket is read only to notice when the peer leaves.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{FrameCodec, SampleFormat};
use crate::error::SinkError;
use crate::relay::{FrameSink, RelayStats, StatsSnapshot, Subscriber, SubscriberRegistry};

/// Write half of an upgraded WebSocket connection.
pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), SinkError> {
        self.sink.send(Message::Binary(frame)).await.map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        // Best effort: the connection may already be broken
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Format of the frames carried on the WebSocket, as advertised by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub frame_size: usize,
    pub bytes_per_frame: usize,
}

impl StreamInfo {
    pub fn new(codec: &FrameCodec, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: codec.channels(),
            sample_format: codec.format(),
            frame_size: codec.frame_size(),
            bytes_per_frame: codec.encoded_len(),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub subscribers: usize,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub stream: StreamInfo,
}

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<SubscriberRegistry<WsSink>>,
    stats: Arc<RelayStats>,
    stream: StreamInfo,
}

impl AppState {
    pub fn new(registry: Arc<SubscriberRegistry<WsSink>>, stats: Arc<RelayStats>, stream: StreamInfo) -> Self {
        Self { registry, stats, stream }
    }
}

/// Build the router with the subscriber endpoint mounted at `path`.
pub fn router(state: AppState, path: &str) -> Router {
    Router::new().route(path, get(handle_upgrade)).route("/status", get(handle_status)).with_state(state)
}

/// Bind the listening socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {}", addr))
}

/// Serve until `cancel` fires.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("🌐 WebSocket server listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Server terminated unexpectedly")?;

    debug!("Server stopped");
    Ok(())
}

/// Handles upgrade requests on the subscriber path.
async fn handle_upgrade(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Rejected connection from {}: {}", peer, rejection);
            return rejection.into_response();
        }
    };

    ws.on_failed_upgrade(move |e| warn!("WebSocket upgrade from {} failed: {}", peer, e))
        .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

/// Lifetime of one subscriber connection.
///
/// Registers the subscriber, then waits for the peer to close, the socket to
/// fail, or the subscriber to be removed elsewhere. Always unregisters on exit.
async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let (sink, mut inbound) = socket.split();
    let subscriber = Arc::new(Subscriber::new(WsSink { sink }, Some(peer)));
    let id = subscriber.id();
    let removed = subscriber.cancelled_token();

    state.registry.add(subscriber);

    loop {
        tokio::select! {
            _ = removed.cancelled() => break,
            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Peer {} closed the connection", peer);
                    break;
                }
                Some(Err(e)) => {
                    debug!("Connection error from {}: {}", peer, e);
                    break;
                }
                // Inbound data is ignored
                Some(Ok(_)) => {}
            }
        }
    }

    state.registry.remove(id).await;
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse { subscribers: state.registry.len(), stats: state.stats.snapshot(), stream: state.stream.clone() })
}
