//! Connection handlers for the Chatter server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use chatter_core::{
    session, Connection, JwtVerifier, Lifecycle, LifecycleConfig, MemoryDirectory, RouteError,
};
use chatter_protocol::{codec, ClientEvent, Encoding, ProtocolError, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handshake, presence and routing.
    pub lifecycle: Lifecycle,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the built-in directory and a JWT verifier.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let directory = MemoryDirectory::with_users(config.directory.users.iter().cloned());
        let verifier = JwtVerifier::new(config.auth.jwt_secret.as_bytes(), config.auth.leeway_secs);
        let lifecycle = Lifecycle::with_config(
            Arc::new(verifier),
            Arc::new(directory),
            LifecycleConfig {
                max_rooms_per_connection: config.limits.max_rooms_per_connection,
            },
        );
        Self::with_lifecycle(lifecycle, config)
    }

    /// Create app state around an existing lifecycle.
    #[must_use]
    pub fn with_lifecycle(lifecycle: Lifecycle, config: Config) -> Self {
        Self { lifecycle, config }
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    encoding: Option<String>,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Chatter server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.lifecycle.presence().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online_users": stats.online_users,
        "connections": stats.connections,
    }))
}

/// Token from the query string, or from an `Authorization: Bearer` header.
fn extract_token(params: &ConnectParams, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// WebSocket upgrade handler.
///
/// The handshake runs before the upgrade, so a rejected client never
/// reaches the registry.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if state.lifecycle.sessions().len() >= state.config.limits.max_connections {
        warn!("Connection limit reached");
        metrics::record_error("connection_limit");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Server is at capacity");
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.transport.origin_allowed(origin) {
        warn!(origin = ?origin, "Origin not allowed");
        metrics::record_error("origin");
        return error_response(StatusCode::FORBIDDEN, "Origin not allowed");
    }

    let encoding = match params.encoding.as_deref().map(str::parse::<Encoding>) {
        None => Encoding::default(),
        Some(Ok(encoding)) => encoding,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let mut conn = Connection::new();
    let token = extract_token(&params, &headers);
    if let Err(e) = state
        .lifecycle
        .authenticate(&mut conn, token.as_deref())
        .await
    {
        metrics::record_auth_failure(e.kind());
        return error_response(StatusCode::UNAUTHORIZED, e.client_message());
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state, conn, encoding))
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    mut conn: Connection,
    encoding: Encoding,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut inbox) = session::channel();

    if let Err(e) = state.lifecycle.activate(&mut conn, outbox).await {
        error!(connection = %conn.id(), error = %e, "Activation failed");
        return;
    }
    update_gauges(&state);

    let max_message_size = state.config.limits.max_message_size;
    let interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection
            Some(event) = inbox.recv() => {
                match encode_event(&event, encoding) {
                    Ok(message) => {
                        metrics::record_event(event.name(), "outbound");
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %conn.id(), error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_message_size {
                            reject(&state, &conn, "Message exceeds maximum size");
                            continue;
                        }
                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => route_event(&state, &conn, event),
                            Err(e) => {
                                debug!(connection = %conn.id(), error = %e, "Undecodable text frame");
                                reject(&state, &conn, "Invalid event payload");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() + read_buffer.len() > max_message_size {
                            read_buffer.clear();
                            reject(&state, &conn, "Message exceeds maximum size");
                            continue;
                        }
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => route_event(&state, &conn, event),
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(connection = %conn.id(), error = %e, "Undecodable binary frame");
                                    read_buffer.clear();
                                    reject(&state, &conn, "Invalid event payload");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    info!(connection = %conn.id(), "Heartbeat timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.lifecycle.close(&mut conn).await;
    update_gauges(&state);
}

/// Route a decoded event and record what happened to it.
fn route_event(state: &AppState, conn: &Connection, event: ClientEvent) {
    let start = std::time::Instant::now();
    metrics::record_event(event.name(), "inbound");

    match state.lifecycle.router().dispatch(conn, event) {
        Ok(outcome) => metrics::record_outcome(outcome),
        Err(RouteError::Validation(_)) => metrics::record_error("validation"),
        Err(_) => metrics::record_error("rejected_event"),
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Report an unusable frame to the sending connection only.
fn reject(state: &AppState, conn: &Connection, reason: &str) {
    metrics::record_error("bad_frame");
    state
        .lifecycle
        .sessions()
        .send(conn.id(), Arc::new(ServerEvent::error(reason)));
}

fn encode_event(event: &ServerEvent, encoding: Encoding) -> Result<Message, ProtocolError> {
    match encoding {
        Encoding::Json => Ok(Message::Text(codec::encode_json(event)?)),
        Encoding::MessagePack => Ok(Message::Binary(codec::encode(event)?.to_vec())),
    }
}

fn update_gauges(state: &AppState) {
    metrics::set_presence(
        state.lifecycle.presence().stats().online_users,
        state.lifecycle.rooms().room_count(),
    );
}
