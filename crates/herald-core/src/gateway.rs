//! Presence protocol on top of the connection registry.
//!
//! The gateway turns transport callbacks into registry bookkeeping and owns
//! everything that needs more than one connection's state: handshakes,
//! typing fan-out, chat-room tracking and pings with acknowledgement.
//!
//! Fan-out always snapshots the target sinks under the registry lock and
//! sends after releasing it. A sink that fails a write is evicted on its own;
//! its siblings still get the event.

use crate::registry::{
    Connection, ConnectionId, ConnectionRegistry, DeviceId, RegistryError, UserId,
};
use crate::sink::{ConnectionSink, SinkError, CLOSE_REJECTED, CLOSE_WRITE_FAILED};
use crate::unix_millis;
use dashmap::DashMap;
use futures_util::future::join_all;
use herald_protocol::{
    ChatMessage, ClientEvent, ConnectionAck, PingEvent, PongAck, ServerEvent, Typing,
    TypingEvent, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The handshake was refused by the registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The acknowledgement could not be written.
    #[error("Failed to acknowledge connection: {0}")]
    Ack(#[from] SinkError),
}

/// Who receives typing indicators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingScope {
    /// Only connections of other users that have the same chat open.
    #[default]
    Room,
    /// Every connection of every other user.
    All,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Default bound for a device ping.
    pub ping_timeout: Duration,
    /// Heartbeat interval advertised to clients.
    pub heartbeat_interval: Duration,
    /// Typing indicator fan-out.
    pub typing_scope: TypingScope,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_secs(25),
            typing_scope: TypingScope::Room,
        }
    }
}

/// Identity offered by a connecting client.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub connection_id: ConnectionId,
    pub user_id: Option<UserId>,
    pub device_id: Option<DeviceId>,
}

impl Handshake {
    /// Create a handshake.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        device_id: Option<DeviceId>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            device_id,
        }
    }
}

/// Result of pinging a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The peer answered; carries the round-trip time.
    Acked(Duration),
    /// No acknowledgement was possible; carries registry liveness.
    PresenceOnly(bool),
    /// The peer did not answer in time.
    TimedOut {
        /// Registry liveness at the time of the timeout.
        registry_live: bool,
    },
}

impl PingOutcome {
    /// Best guess at whether the device is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        match self {
            PingOutcome::Acked(_) => true,
            PingOutcome::PresenceOnly(live) => *live,
            PingOutcome::TimedOut { registry_live } => *registry_live,
        }
    }

    /// Whether the peer confirmed it is responsive.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        matches!(self, PingOutcome::Acked(_))
    }
}

/// Result of pushing a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatDelivery {
    /// At least one connection of the receiver got the message.
    pub delivered: bool,
    /// The receiver has the chat open on some connection.
    pub viewing: bool,
}

struct PendingPing {
    connection_id: ConnectionId,
    tx: oneshot::Sender<()>,
}

/// Removes a pending ping when the pinging future ends or is dropped.
struct PendingPingGuard<'a> {
    pings: &'a DashMap<u64, PendingPing>,
    id: u64,
}

impl Drop for PendingPingGuard<'_> {
    fn drop(&mut self) {
        self.pings.remove(&self.id);
    }
}

type Target = (ConnectionId, Arc<dyn ConnectionSink>);

/// The presence gateway.
pub struct PresenceGateway {
    registry: Arc<ConnectionRegistry>,
    config: GatewayConfig,
    pending_pings: DashMap<u64, PendingPing>,
    next_ping: AtomicU64,
}

impl PresenceGateway {
    /// Create a gateway with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, GatewayConfig::default())
    }

    /// Create a gateway with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: GatewayConfig) -> Self {
        info!("Creating presence gateway with config: {:?}", config);
        Self {
            registry,
            config,
            pending_pings: DashMap::new(),
            next_ping: AtomicU64::new(1),
        }
    }

    /// Get the underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Accept a connection.
    ///
    /// On success the client has been sent `connection_ack`. A handshake
    /// without any identity closes the sink and sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Registry`] when the handshake carries no ID and
    /// [`GatewayError::Ack`] when the acknowledgement cannot be written (the
    /// connection is unregistered again in that case).
    pub fn connect(
        &self,
        handshake: Handshake,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<ConnectionAck, GatewayError> {
        let registered = match self.registry.register(
            handshake.connection_id.clone(),
            handshake.user_id,
            handshake.device_id,
            sink.clone(),
        ) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(connection = %handshake.connection_id, "Rejected handshake: {}", e);
                sink.close(CLOSE_REJECTED, "userId or deviceId required");
                return Err(e.into());
            }
        };

        let connection = registered.connection;
        let ack = ConnectionAck {
            status: "connected".into(),
            user_id: connection.user_id.clone(),
            device_id: connection.device_id.clone(),
            connection_id: connection.id.to_string(),
            timestamp: unix_millis(),
            heartbeat_ms: self.config.heartbeat_interval.as_millis() as u64,
            version: PROTOCOL_VERSION,
        };

        if let Err(e) = sink.send(&ServerEvent::ConnectionAck(ack.clone())) {
            self.registry.unregister(&connection.id);
            return Err(e.into());
        }

        info!(
            connection = %connection.id,
            user = ?connection.user_id,
            device = ?connection.device_id,
            replaced = registered.replaced.len(),
            "Client connected"
        );

        Ok(ack)
    }

    /// Handle one inbound event.
    ///
    /// Every event counts as activity. Returns `false` if the connection is
    /// no longer registered.
    pub fn handle_event(&self, connection_id: &ConnectionId, event: ClientEvent) -> bool {
        if !self.registry.touch(connection_id) {
            debug!(connection = %connection_id, event = event.name(), "Event from unknown connection");
            return false;
        }

        match event {
            ClientEvent::Heartbeat | ClientEvent::Pong(PongAck { id: None }) => {
                trace!(connection = %connection_id, "Heartbeat");
            }
            ClientEvent::Pong(PongAck { id: Some(id) }) => {
                self.resolve_ping(connection_id, id);
            }
            ClientEvent::SetActiveChat(active) => {
                self.set_active_chat_room(connection_id, active.chat_id);
            }
            ClientEvent::UserTyping(typing) => {
                self.broadcast_typing(connection_id, typing);
            }
            ClientEvent::Register(_) => {
                debug!(connection = %connection_id, "Ignoring register after handshake");
            }
        }

        true
    }

    /// Handle a transport disconnect.
    ///
    /// Pings still waiting on this connection resolve as not acknowledged.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.pending_pings
            .retain(|_, pending| pending.connection_id != *connection_id);

        let removed = self.registry.unregister(connection_id);
        if let Some(connection) = &removed {
            info!(
                connection = %connection.id,
                user = ?connection.user_id,
                device = ?connection.device_id,
                "Client disconnected"
            );
        }
        removed
    }

    /// Record which chat a connection has open; `None` clears it.
    pub fn set_active_chat_room(&self, connection_id: &ConnectionId, chat_id: Option<String>) -> bool {
        let known = self.registry.set_active_chat(connection_id, chat_id.clone());
        if known {
            debug!(connection = %connection_id, chat = ?chat_id, "Active chat changed");
        }
        known
    }

    /// Check whether any connection of a user has a chat open.
    #[must_use]
    pub fn is_viewing_chat(&self, user_id: &str, chat_id: &str) -> bool {
        self.registry
            .connections_for_user(user_id)
            .iter()
            .any(|c| c.active_chat.as_deref() == Some(chat_id))
    }

    /// Fan a typing indicator out to other users.
    ///
    /// The sender's own connections never receive it. Returns the number of
    /// connections reached.
    pub fn broadcast_typing(&self, from: &ConnectionId, typing: Typing) -> usize {
        let Some(user_id) = self.registry.connection(from).and_then(|c| c.user_id) else {
            debug!(connection = %from, "Typing from connection without a user");
            return 0;
        };

        let scope = self.config.typing_scope;
        let chat_id = typing.chat_id.clone();
        let targets = self.registry.sinks_where(|c| {
            let other_user = c.user_id.as_deref().is_some_and(|u| u != user_id);
            other_user
                && (scope == TypingScope::All || c.active_chat.as_deref() == Some(chat_id.as_str()))
        });

        let event = ServerEvent::UserTyping(TypingEvent {
            user_id,
            user_name: typing.user_name,
            chat_id: typing.chat_id,
            typing: typing.typing,
        });

        self.fan_out(targets, &event)
    }

    /// Push an event to every connection of a user.
    ///
    /// Returns `false` only if the user has no connections. Sockets that fail
    /// the write are evicted; the rest still count as delivered.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> bool {
        let targets = self.registry.user_sinks(user_id);
        if targets.is_empty() {
            debug!(user = %user_id, event = event.name(), "User has no live connections");
            return false;
        }

        self.fan_out(targets, event);
        true
    }

    /// Push an event to a device's current connection.
    pub fn send_to_device(&self, device_id: &str, event: &ServerEvent) -> bool {
        match self.registry.device_sink(device_id) {
            Some(target) => self.fan_out(vec![target], event) == 1,
            None => {
                debug!(device = %device_id, event = event.name(), "Device has no connection");
                false
            }
        }
    }

    /// Push an event to every connection. Returns the number reached.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let targets = self.registry.sinks_where(|_| true);
        self.fan_out(targets, event)
    }

    /// Push a chat message as `new_message`.
    ///
    /// `viewing` tells the caller whether a notification would duplicate what
    /// the receiver already sees.
    pub fn deliver_chat_message(
        &self,
        user_id: &str,
        chat_id: &str,
        message: serde_json::Value,
    ) -> ChatDelivery {
        let viewing = self.is_viewing_chat(user_id, chat_id);
        let event = ServerEvent::NewMessage(ChatMessage {
            chat_id: chat_id.to_string(),
            message,
        });
        ChatDelivery {
            delivered: self.send_to_user(user_id, &event),
            viewing,
        }
    }

    /// Ping a device with the configured timeout.
    pub async fn ping(&self, device_id: &str) -> PingOutcome {
        self.ping_device(device_id, self.config.ping_timeout).await
    }

    /// Ping a device and wait at most `timeout` for the answer.
    ///
    /// Never waits longer than `timeout`. Peers that cannot answer fall back
    /// to registry liveness.
    pub async fn ping_device(&self, device_id: &str, timeout: Duration) -> PingOutcome {
        let Some((connection_id, sink)) = self.registry.device_sink(device_id) else {
            return PingOutcome::PresenceOnly(false);
        };

        if !sink.supports_ack() {
            return PingOutcome::PresenceOnly(self.registry.is_device_live(device_id));
        }

        let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pings.insert(
            id,
            PendingPing {
                connection_id: connection_id.clone(),
                tx,
            },
        );
        let _pending = PendingPingGuard {
            pings: &self.pending_pings,
            id,
        };

        let started = Instant::now();
        let ping = ServerEvent::Ping(PingEvent {
            id,
            timestamp: unix_millis(),
        });
        if let Err(e) = sink.send(&ping) {
            warn!(device = %device_id, connection = %connection_id, "Ping write failed: {}", e);
            self.evict(&connection_id, sink.as_ref());
            return PingOutcome::PresenceOnly(false);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                let rtt = started.elapsed();
                trace!(device = %device_id, rtt_ms = rtt.as_millis() as u64, "Ping acknowledged");
                PingOutcome::Acked(rtt)
            }
            Ok(Err(_)) => PingOutcome::PresenceOnly(false),
            Err(_) => {
                let registry_live = self.registry.is_device_live(device_id);
                debug!(device = %device_id, registry_live, "Ping timed out");
                PingOutcome::TimedOut { registry_live }
            }
        }
    }

    /// Ping several devices concurrently, each bounded by `timeout`.
    pub async fn ping_devices<I, S>(&self, device_ids: I, timeout: Duration) -> HashMap<DeviceId, PingOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        let ids: BTreeSet<DeviceId> = device_ids.into_iter().map(Into::into).collect();
        let pings = ids.into_iter().map(|id| async move {
            let outcome = self.ping_device(&id, timeout).await;
            (id, outcome)
        });
        join_all(pings).await.into_iter().collect()
    }

    /// Get the number of pings awaiting an answer.
    #[must_use]
    pub fn pending_ping_count(&self) -> usize {
        self.pending_pings.len()
    }

    fn resolve_ping(&self, connection_id: &ConnectionId, id: u64) {
        match self
            .pending_pings
            .remove_if(&id, |_, pending| pending.connection_id == *connection_id)
        {
            Some((_, pending)) => {
                // The pinging side may already have timed out.
                let _ = pending.tx.send(());
            }
            None => trace!(connection = %connection_id, ping = id, "Pong for unknown ping"),
        }
    }

    fn fan_out(&self, targets: Vec<Target>, event: &ServerEvent) -> usize {
        let mut reached = 0;
        for (connection_id, sink) in targets {
            match sink.send(event) {
                Ok(()) => reached += 1,
                Err(e) => {
                    warn!(
                        connection = %connection_id,
                        event = event.name(),
                        "Write failed, evicting connection: {}",
                        e
                    );
                    self.evict(&connection_id, sink.as_ref());
                }
            }
        }
        reached
    }

    fn evict(&self, connection_id: &ConnectionId, sink: &dyn ConnectionSink) {
        if self.registry.unregister(connection_id).is_some() {
            self.pending_pings
                .retain(|_, pending| pending.connection_id != *connection_id);
            sink.close(CLOSE_WRITE_FAILED, "Write failed");
        }
    }
}
