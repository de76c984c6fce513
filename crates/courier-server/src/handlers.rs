//! WebSocket upgrade endpoint and socket pumps.
//!
//! The upgrade handler resolves the bearer credential to an identity before
//! any registry state exists; only then is the socket upgraded, the
//! connection registered, and the read/write loops started. The `WsStream`/
//! `WsSink` adapters implement the core transport seam over the split axum
//! socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use courier_core::{
    read_loop, write_loop, AuthResolver, ConnectionHandle, CoordinatorHandle, FrameSink,
    FrameStream, Inbound, MessageStore, TransportError,
};
use courier_protocol::{codec, Frame, Identity};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the hub's event loop.
    pub coordinator: CoordinatorHandle,
    /// Credential resolver.
    pub auth: Arc<dyn AuthResolver>,
    /// Message persistence.
    pub store: Arc<dyn MessageStore>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    coordinator: CoordinatorHandle,
    auth: Arc<dyn AuthResolver>,
    store: Arc<dyn MessageStore>,
) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let ws_path = config.transport.websocket_path.clone();
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        coordinator,
        auth,
        store,
        config,
    });

    // Build router
    let app = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
///
/// Rejects with `401 Unauthorized` before the upgrade when no credential is
/// present or resolution fails, so no partially registered connection can
/// ever exist.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(credential) = bearer_credential(&headers, &params) else {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    };

    match state.auth.resolve(&credential).await {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, identity, state))
            .into_response(),
        Err(e) => {
            warn!(error = %e, "websocket auth failed");
            metrics::record_error("auth");
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        }
    }
}

/// Extract the bearer credential: `Authorization` header first, `token`
/// query parameter as a fallback.
fn bearer_credential(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    params
        .get("token")
        .filter(|token| !token.is_empty())
        .cloned()
}

/// Handle an authenticated WebSocket connection.
async fn handle_socket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let conn_config = state.config.connection_config();
    let (conn, outbound) = ConnectionHandle::channel(identity, conn_config.queue_capacity);

    if state.coordinator.register(conn.clone()).await.is_err() {
        error!(identity, "coordinator unavailable; dropping connection");
        return;
    }

    debug!(conn = %conn.id(), identity, "websocket connected");

    let (sink, stream) = socket.split();
    let sink = WsSink { inner: sink };
    let stream = WsStream {
        inner: stream,
        max_frame_size: state.config.limits.max_frame_size,
    };

    let writer = tokio::spawn(write_loop(
        sink,
        conn.clone(),
        outbound,
        conn_config.clone(),
    ));

    read_loop(
        stream,
        conn.clone(),
        state.coordinator.clone(),
        Arc::clone(&state.store),
        conn_config,
    )
    .await;

    // Unregistering closed the outbound queue; wait for the write loop to
    // drain and close the transport.
    let _ = writer.await;

    debug!(conn = %conn.id(), identity, "websocket disconnected");
}

/// Receiving half of an upgraded socket.
struct WsStream {
    inner: SplitStream<WebSocket>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError> {
        let message = match self.inner.next().await {
            None => return Ok(None),
            Some(Err(e)) => return Err(TransportError::Recv(e.to_string())),
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => {
                metrics::record_frame(text.len(), "inbound");
                let frame = codec::decode_limited(text.as_bytes(), self.max_frame_size)?;
                Ok(Some(Inbound::Frame(frame)))
            }
            Message::Binary(data) => {
                metrics::record_frame(data.len(), "inbound");
                let frame = codec::decode_limited(&data, self.max_frame_size)?;
                Ok(Some(Inbound::Frame(frame)))
            }
            // The transport layer answers pings itself; both directions
            // count as liveness.
            Message::Ping(_) | Message::Pong(_) => Ok(Some(Inbound::Pong)),
            Message::Close(_) => Ok(None),
        }
    }
}

/// Sending half of an upgraded socket.
struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let encoded = codec::encode(frame)?;
        metrics::record_frame(encoded.len(), "outbound");
        self.inner
            .send(Message::Text(encoded))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}
