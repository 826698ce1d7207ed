//! HTTP routes and WebSocket session handling.
//!
//! One axum router serves the health endpoints and the WebSocket upgrade
//! path on the same listener. Every response carries permissive CORS
//! headers and any other path gets 404. An upgraded socket runs one relay
//! session: the read loop, the writer task and cleanup.

use crate::{
    connection::{ConnectionId, ConnectionRegistry, Outbound, OutboundSender},
    health::{HealthCheckResult, HealthManager},
    messaging::FrameRouter,
    presence::PresenceBroadcaster,
    shutdown::ShutdownState,
};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, trace, warn};

/// Request headers browsers may send cross-origin, tracing headers included.
const ALLOWED_HEADERS: [&str; 9] = [
    "content-type",
    "authorization",
    "x-datadog-trace-id",
    "x-datadog-parent-id",
    "x-datadog-origin",
    "x-datadog-sampling-priority",
    "traceparent",
    "tracestate",
    "b3",
];

const EXPOSED_HEADERS: [&str; 4] = ["x-datadog-trace-id", "x-datadog-parent-id", "traceparent", "tracestate"];

const SHUTDOWN_REASON: &str = "server shutting down";

/// Everything a request handler needs, shared across all connections.
pub(crate) struct ConnectionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<FrameRouter>,
    pub presence: Arc<PresenceBroadcaster>,
    pub health: Arc<HealthManager>,
    pub shutdown: ShutdownState,
    pub max_connections: usize,
    pub outbound_queue_size: usize,
    /// Cloned into every session; the server waits until all clones drop
    pub sessions: mpsc::Sender<()>,
}

/// Why a connection's tasks stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// The client sent a close frame or the stream ended
    PeerClosed,
    /// The relay sent a close frame
    LocalClose,
    /// The socket was dropped without a close handshake
    Terminated,
    /// A read or write failed
    Failed,
}

/// Builds the relay's HTTP surface.
///
/// * `GET /healthz` - liveness, `200 ok`
/// * `GET /` - service status as JSON
/// * `GET {ws_path}` - WebSocket upgrade
/// * `OPTIONS` on any path - CORS preflight, `200`
pub(crate) fn build_router(ctx: Arc<ConnectionContext>, ws_path: &str) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/", get(status))
        .route(ws_path, get(ws_upgrade))
        .with_state(ctx)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(ALLOWED_HEADERS.map(HeaderName::from_static))
        .expose_headers(EXPOSED_HEADERS.map(HeaderName::from_static))
}

async fn liveness(State(ctx): State<Arc<ConnectionContext>>) -> &'static str {
    ctx.health.liveness_check()
}

async fn status(State(ctx): State<Arc<ConnectionContext>>) -> Json<HealthCheckResult> {
    Json(ctx.health.status())
}

/// Accepts a WebSocket upgrade unless the relay is full or stopping.
async fn ws_upgrade(
    State(ctx): State<Arc<ConnectionContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if ctx.shutdown.is_shutdown_initiated() {
        debug!(client_ip = %addr, "Refusing upgrade during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let connections = ctx.registry.connection_count().await;
    if connections >= ctx.max_connections {
        warn!(client_ip = %addr, connections, "Refusing upgrade, relay at capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let session = ctx.sessions.clone();
    ws.on_upgrade(move |socket| async move {
        run_session(socket, addr, ctx).await;
        drop(session);
    })
}

async fn run_session(socket: WebSocket, addr: SocketAddr, ctx: Arc<ConnectionContext>) {
    let (outbound, outbound_rx) = OutboundSender::channel(ctx.outbound_queue_size);
    let connection_id = ctx.registry.open(addr, outbound.clone()).await;
    if ctx.shutdown.is_shutdown_initiated() {
        // Opened after the shutdown drain; close it here instead
        outbound.close_or_terminate(SHUTDOWN_REASON);
    }
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let ended = {
        let writer = write_outbound(&mut ws_sender, &outbound, outbound_rx, connection_id);
        let reader = async {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        ctx.router.handle(connection_id, text.as_str()).await;
                    }
                    Ok(Message::Pong(_)) => ctx.registry.mark_alive(connection_id).await,
                    // Answered by the protocol layer
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(frame)) => {
                        debug!(connection_id = %connection_id, ?frame, "🔌 Client requested close");
                        ctx.registry.begin_close(connection_id).await;
                        return ConnectionEnd::PeerClosed;
                    }
                    Ok(Message::Binary(data)) => {
                        trace!(connection_id = %connection_id, bytes = data.len(), "Ignoring binary frame");
                    }
                    Err(e) => {
                        debug!(connection_id = %connection_id, "WebSocket read error: {}", e);
                        return ConnectionEnd::Failed;
                    }
                }
            }
            ConnectionEnd::PeerClosed
        };

        // Run both halves until either completes
        tokio::select! {
            ended = writer => ended,
            ended = reader => ended,
        }
    };

    if ended == ConnectionEnd::PeerClosed {
        // Flushes the close reply queued by the protocol layer
        let _ = ws_sender.close().await;
    }

    match ctx.registry.close(connection_id).await {
        Some(entry) => {
            let session = Utc::now().signed_duration_since(entry.joined_at);
            info!(
                connection_id = %connection_id,
                user_id = %entry.user_id,
                session_secs = session.num_seconds(),
                reason = ?ended,
                "👋 User left"
            );
            if !ctx.shutdown.is_shutdown_initiated() {
                ctx.presence.broadcast().await;
            }
        }
        None => debug!(connection_id = %connection_id, reason = ?ended, "Connection closed"),
    }
}

/// Drains a connection's outbound queue into the socket.
async fn write_outbound<S>(
    ws_sender: &mut S,
    outbound: &OutboundSender,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    connection_id: ConnectionId,
) -> ConnectionEnd
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = outbound.terminated() => {
                debug!(connection_id = %connection_id, "Dropping socket without close handshake");
                return ConnectionEnd::Terminated;
            }
            item = outbound_rx.recv() => item,
        };

        match item {
            Some(Outbound::Frame(message)) => {
                if let Err(e) = ws_sender.send(message).await {
                    warn!(connection_id = %connection_id, "Failed to send frame: {}", e);
                    return ConnectionEnd::Failed;
                }
            }
            Some(Outbound::Close(reason)) => {
                let frame = CloseFrame { code: close_code::NORMAL, reason: reason.into() };
                if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                    debug!(connection_id = %connection_id, "Failed to send close frame: {}", e);
                }
                return ConnectionEnd::LocalClose;
            }
            None => return ConnectionEnd::LocalClose,
        }
    }
}
