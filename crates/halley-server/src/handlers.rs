//! Transport handlers for the Halley server.
//!
//! Both transports decode JSON message batches, hand them to the engine and
//! send back whatever packets it produces. Long-polling clients receive
//! deliveries in the response to their next `/meta/connect`; WebSocket
//! clients have them pushed as they happen.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, EngineMetrics};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use halley_core::{AckExtension, Carrier, Outlet, Packet, Server, TimesyncExtension};
use halley_protocol::{codec, fields, Message};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The engine.
    pub server: Arc<Server>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let server = Server::new(config.engine.clone()).context("Invalid engine configuration")?;
        server.set_transports(config.transport.enabled());
        EngineMetrics::install(&server);
        if config.extensions.ack {
            AckExtension::install(&server, config.extensions.ack_queue_size);
        }
        if config.extensions.timesync {
            TimesyncExtension::install(&server);
        }

        Ok(Self {
            server: Arc::new(server),
            config,
        })
    }
}

/// Build the HTTP router for the enabled transports.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    let mut app = Router::new().route("/health", get(health_handler));
    if transport.long_polling {
        app = app.route(&transport.long_polling_path, post(long_poll_handler));
    }
    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }
    app.layer(DefaultBodyLimit::max(state.config.limits.max_message_size))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    state.server.start_up().await?;
    let maintenance = state.server.start();

    let app = router(state.clone());
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Halley server listening on {}", addr);
    if config.transport.long_polling {
        info!(
            "Long-polling endpoint: http://{}{}",
            addr, config.transport.long_polling_path
        );
    }
    if config.transport.websocket {
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, config.transport.websocket_path
        );
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.stop();
    state.server.shut_down().await?;
    info!("Halley server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.server.channels().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.server.sessions().len(),
        "channels": stats.channel_count,
        "subscriptions": stats.total_subscriptions,
    }))
}

/// Flatten response packets into one outbound batch.
fn outbound(packets: Vec<Packet>) -> Vec<Message> {
    packets.into_iter().flat_map(Packet::into_messages).collect()
}

/// Long-polling handler: one POSTed batch in, one batch out.
async fn long_poll_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let start = Instant::now();
    metrics::record_message(body.len(), "inbound");

    let messages = match codec::decode(&body) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Rejecting undecodable long-poll batch");
            metrics::record_error("decode");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let packets = state
        .server
        .on_request(&Carrier::long_polling(), messages)
        .await;

    let response = match codec::encode(&outbound(packets)) {
        Ok(data) => {
            metrics::record_message(data.len(), "outbound");
            ([(header::CONTENT_TYPE, "application/json")], data).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode long-poll response");
            metrics::record_error("encode");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };
    metrics::record_latency(start.elapsed().as_secs_f64());
    response
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Pushes deliveries into the socket's outbound queue.
struct SocketOutlet(mpsc::UnboundedSender<Packet>);

impl Outlet for SocketOutlet {
    fn push(&self, packet: Packet) -> bool {
        self.0.send(packet).is_ok()
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!("WebSocket connected");

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let carrier = Carrier::websocket(Arc::new(SocketOutlet(push_tx)));
    let (mut sender, mut receiver) = socket.split();

    // Sessions handshaken over this socket, purged when it closes.
    let mut client_ids: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            biased;

            Some(packet) = push_rx.recv() => {
                if send_packets(&mut sender, vec![packet]).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let payload = match msg {
                    Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                    Some(Ok(WsMessage::Binary(data))) => data,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sender.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };

                let start = Instant::now();
                metrics::record_message(payload.len(), "inbound");
                let messages = match codec::decode(&payload) {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable WebSocket frame");
                        metrics::record_error("decode");
                        continue;
                    }
                };

                let packets = state.server.on_request(&carrier, messages).await;
                track_handshakes(&packets, &mut client_ids);
                let sent = send_packets(&mut sender, packets).await;
                metrics::record_latency(start.elapsed().as_secs_f64());
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    for client_id in client_ids {
        if let Some(session) = state.server.sessions().get(&client_id) {
            state.server.purge_session(&session);
        }
    }
    debug!("WebSocket disconnected");
}

/// Remember the sessions created by successful handshakes in `packets`.
fn track_handshakes(packets: &[Packet], client_ids: &mut HashSet<String>) {
    for message in packets.iter().flat_map(Packet::messages) {
        if message.channel() == Some("/meta/handshake") && message.successful() == Some(true) {
            if let Some(client_id) = message.get(fields::CLIENT_ID).and_then(|v| v.as_str()) {
                client_ids.insert(client_id.to_string());
            }
        }
    }
}

/// Send packets to the WebSocket as one text frame.
async fn send_packets(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    packets: Vec<Packet>,
) -> Result<()> {
    let messages = outbound(packets);
    if messages.is_empty() {
        return Ok(());
    }
    let text = codec::encode_text(&messages)?;
    metrics::record_message(text.len(), "outbound");
    sender.send(WsMessage::Text(text)).await?;
    Ok(())
}
