//! Connection handlers for Herald server.
//!
//! Each WebSocket runs two tasks: the reader below, which feeds inbound
//! events to the gateway, and a writer that drains the connection's
//! [`ChannelSink`] queue. The gateway only ever talks to the sink.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::transports::{HttpMailer, TelegramBot};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use herald_core::{
    ChannelSink, ConnectionId, ConnectionRegistry, Handshake, MemoryStore,
    NotificationDispatcher, Outbound, PingOutcome, PresenceGateway, RateLimiter,
};
use herald_protocol::{codec, ClientEvent, Registration};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Presence protocol.
    pub gateway: Arc<PresenceGateway>,
    /// Notification delivery.
    pub dispatcher: NotificationDispatcher,
    /// Rate limiter for sensitive operations.
    pub limiter: Arc<RateLimiter>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_config(
            config.presence.registry_config(),
        ));
        let gateway = Arc::new(PresenceGateway::with_config(
            registry.clone(),
            config.presence.gateway_config(),
        ));

        let mut dispatcher = NotificationDispatcher::new(Arc::new(MemoryStore::new()), gateway.clone());
        match HttpMailer::from_config(&config.notifications.email) {
            Some(mailer) => dispatcher = dispatcher.with_email(Arc::new(mailer)),
            None => info!("Email delivery disabled"),
        }
        match TelegramBot::from_config(&config.notifications.telegram) {
            Some(bot) => dispatcher = dispatcher.with_bot(Arc::new(bot)),
            None => info!("Telegram delivery disabled"),
        }

        Self {
            registry,
            gateway,
            dispatcher,
            limiter: Arc::new(RateLimiter::new()),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let background = vec![
        state.registry.spawn_sweeper(shutdown.clone()),
        state
            .limiter
            .spawn_sweeper(config.rate_limit_sweep_interval(), shutdown.clone()),
        state
            .dispatcher
            .spawn_cleanup(config.cleanup_interval(), shutdown.clone()),
    ];

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence", get(presence_handler))
        .route("/presence/devices", get(devices_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Herald server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Herald server stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Connection statistics.
async fn presence_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    metrics::set_presence(stats);

    Json(serde_json::json!({
        "connections": stats.connections,
        "users": stats.users,
        "devices": stats.devices,
        "liveDevices": state.registry.live_device_ids().len(),
        "pendingPings": state.gateway.pending_ping_count(),
        "rateLimitEntries": state.limiter.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct DevicesQuery {
    /// Comma-separated device IDs.
    #[serde(default)]
    ids: String,
}

/// Ping the requested devices and report who answered.
async fn devices_handler(
    Query(query): Query<DevicesQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let ids = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from);

    let outcomes = state
        .gateway
        .ping_devices(ids, state.gateway.config().ping_timeout)
        .await;

    let report: BTreeMap<String, serde_json::Value> = outcomes
        .into_iter()
        .map(|(device, outcome)| (device, device_status(outcome)))
        .collect();

    Json(report)
}

fn device_status(outcome: PingOutcome) -> serde_json::Value {
    let rtt_ms = match outcome {
        PingOutcome::Acked(rtt) => Some(rtt.as_millis() as u64),
        _ => None,
    };
    serde_json::json!({
        "online": outcome.is_online(),
        "acked": outcome.is_acked(),
        "rttMs": rtt_ms,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

impl HandshakeQuery {
    fn has_identity(&self) -> bool {
        [&self.user_id, &self.device_id]
            .iter()
            .any(|id| id.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HandshakeQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, query, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, query: HandshakeQuery, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();
    let (sender, mut receiver) = socket.split();

    let (sink, outbound) = ChannelSink::new();
    let mut writer = tokio::spawn(write_loop(sender, outbound, connection_id.clone()));

    let registration = if query.has_identity() {
        Registration {
            user_id: query.user_id,
            device_id: query.device_id,
        }
    } else {
        debug!(connection = %connection_id, "No identity in query, waiting for register");
        await_registration(&mut receiver, state.config.handshake_timeout())
            .await
            .unwrap_or_default()
    };

    let handshake = Handshake::new(
        connection_id.clone(),
        registration.user_id,
        registration.device_id,
    );
    if state.gateway.connect(handshake, Arc::new(sink)).is_err() {
        metrics::record_handshake_rejection();
        // The writer flushes the rejection close frame and exits.
        if let Err(e) = writer.await {
            warn!(connection = %connection_id, "Writer task failed: {}", e);
        }
        return;
    }

    let _metrics_guard = ConnectionMetricsGuard::new();
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(connection = %connection_id, "Writer finished");
                break;
            }

            msg = receiver.next() => {
                let keep_open = match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_event(text.len(), "inbound");
                        let alive = handle_text(&state, &connection_id, &text);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        alive
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_event(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        let alive = handle_binary(&state, &connection_id, &mut read_buffer);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        alive
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        state.registry.touch(&connection_id)
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        false
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        false
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        false
                    }
                };

                if !keep_open {
                    break;
                }
            }
        }
    }

    // Dropping the registry's sink closes the queue and stops the writer.
    state.gateway.disconnect(&connection_id);
    if !writer.is_finished() {
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle one text frame. Returns `false` once the connection is gone.
fn handle_text(state: &AppState, connection_id: &ConnectionId, text: &str) -> bool {
    match codec::decode_text(text) {
        Ok(event) => state.gateway.handle_event(connection_id, event),
        Err(e) => {
            debug!(
                connection = %connection_id,
                event = ?codec::peek_event_name(text),
                "Undecodable event: {}",
                e
            );
            metrics::record_error("decode");
            state.registry.touch(connection_id)
        }
    }
}

/// Handle every complete binary frame in the buffer.
fn handle_binary(state: &AppState, connection_id: &ConnectionId, buffer: &mut BytesMut) -> bool {
    loop {
        match codec::decode_binary_from::<ClientEvent>(buffer) {
            Ok(Some(event)) => {
                if !state.gateway.handle_event(connection_id, event) {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Invalid binary frame");
                metrics::record_error("decode");
                buffer.clear();
                return state.registry.touch(connection_id);
            }
        }
    }
}

/// Wait for an explicit `register` event.
async fn await_registration(
    receiver: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Option<Registration> {
    let wait = async {
        while let Some(Ok(msg)) = receiver.next().await {
            let event = match msg {
                Message::Text(text) => codec::decode_text(&text).ok(),
                Message::Binary(data) => codec::decode_binary::<ClientEvent>(&data).ok(),
                Message::Close(_) => return None,
                _ => None,
            };
            if let Some(ClientEvent::Register(registration)) = event {
                return Some(registration);
            }
        }
        None
    };

    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// Drain a connection's outbound queue onto the socket.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<Outbound>,
    connection_id: ConnectionId,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Event(event) => {
                let text = match codec::encode_text(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection = %connection_id, event = event.name(), "Encode failed: {}", e);
                        metrics::record_error("encode");
                        continue;
                    }
                };
                metrics::record_event(text.len(), "outbound");
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!(connection = %connection_id, "Socket closed while writing");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                metrics::record_close(code);
                debug!(connection = %connection_id, code, reason = %reason, "Closing socket");
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                // The peer may be gone already.
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::ConnectionSink;
    use herald_protocol::ServerEvent;

    fn state() -> AppState {
        AppState::new(Config::default())
    }

    fn register(state: &AppState, id: &str, user: &str) -> UnboundedReceiver<Outbound> {
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn ConnectionSink> = Arc::new(sink);
        state
            .gateway
            .connect(Handshake::new(id.into(), Some(user.into()), None), sink)
            .unwrap();
        rx
    }

    #[test]
    fn test_handshake_query_identity() {
        let empty: HandshakeQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!empty.has_identity());

        let blank = HandshakeQuery {
            user_id: Some(" ".into()),
            device_id: None,
        };
        assert!(!blank.has_identity());

        let device: HandshakeQuery =
            serde_json::from_value(serde_json::json!({"deviceId": "kiosk-1"})).unwrap();
        assert!(device.has_identity());
    }

    #[test]
    fn test_text_events_reach_gateway() {
        let state = state();
        let mut rx = register(&state, "conn-1", "user-1");
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Event(ServerEvent::ConnectionAck(_))
        ));

        let id = ConnectionId::from("conn-1");
        assert!(handle_text(
            &state,
            &id,
            r#"{"event":"set_active_chat","data":{"chatId":"chat-1"}}"#
        ));
        assert!(state.gateway.is_viewing_chat("user-1", "chat-1"));

        assert!(handle_text(&state, &id, r#"{"event":"dance"}"#));
        assert!(!handle_text(&state, &"gone".into(), r#"{"event":"heartbeat"}"#));
    }

    #[test]
    fn test_binary_events_reach_gateway() {
        let state = state();
        let _rx = register(&state, "conn-1", "user-1");
        let id = ConnectionId::from("conn-1");

        let mut buffer = BytesMut::new();
        codec::encode_binary_into(
            &ClientEvent::SetActiveChat(herald_protocol::ActiveChat {
                chat_id: Some("chat-9".into()),
            }),
            &mut buffer,
        )
        .unwrap();
        let split = buffer.len() - 2;
        let tail = buffer.split_off(split);

        assert!(handle_binary(&state, &id, &mut buffer));
        assert!(!state.gateway.is_viewing_chat("user-1", "chat-9"));

        buffer.extend_from_slice(&tail);
        assert!(handle_binary(&state, &id, &mut buffer));
        assert!(state.gateway.is_viewing_chat("user-1", "chat-9"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_device_status_shape() {
        let acked = device_status(PingOutcome::Acked(Duration::from_millis(12)));
        assert_eq!(
            acked,
            serde_json::json!({"online": true, "acked": true, "rttMs": 12})
        );

        let fallback = device_status(PingOutcome::TimedOut { registry_live: true });
        assert_eq!(
            fallback,
            serde_json::json!({"online": true, "acked": false, "rttMs": null})
        );
    }
}
