//! Live connection registry.
//!
//! The registry is the single source of truth for who is connected and on
//! what. Connections are indexed three ways (by connection, user and device)
//! and all three indexes change together under one lock.
//!
//! Device bindings are exclusive: registering a connection for a device
//! closes every older connection of that device. User bindings are shared:
//! a user may hold any number of connections (tabs, apps, machines).

use crate::sink::{ConnectionSink, CLOSE_IDLE, CLOSE_REPLACED};
use crate::sweeper::spawn_periodic;
use crate::unix_millis;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A user identifier.
pub type UserId = String;

/// A device identifier.
pub type DeviceId = String;

/// Counter mixed into generated IDs so two IDs minted in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Transport-assigned connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from a transport-provided value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Registration carried neither a user ID nor a device ID.
    #[error("Connection {0} has neither a user ID nor a device ID")]
    InvalidBinding(ConnectionId),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A device counts as live only with activity inside this window.
    pub liveness_window: Duration,
    /// Connections idle longer than this are evicted by the sweep.
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(2 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Snapshot of one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: Option<UserId>,
    pub device_id: Option<DeviceId>,
    /// Registration time, unix milliseconds.
    pub connected_at: u64,
    /// Last inbound activity.
    pub last_activity: Instant,
    /// Chat the connection currently has open.
    pub active_chat: Option<String>,
}

impl Connection {
    /// Time since the last inbound activity.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registered {
    /// The new connection.
    pub connection: Connection,
    /// Older connections of the same device that were closed.
    pub replaced: Vec<ConnectionId>,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered connections.
    pub connections: usize,
    /// Number of distinct users with at least one connection.
    pub users: usize,
    /// Number of distinct devices with a connection.
    pub devices: usize,
}

struct Entry {
    info: Connection,
    sink: Arc<dyn ConnectionSink>,
}

/// The three indexes. Only ever touched through the registry lock.
#[derive(Default)]
struct Indexes {
    connections: HashMap<ConnectionId, Entry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_device: HashMap<DeviceId, HashSet<ConnectionId>>,
}

impl Indexes {
    fn insert(&mut self, entry: Entry) {
        let id = entry.info.id.clone();
        if let Some(user_id) = &entry.info.user_id {
            self.by_user
                .entry(user_id.clone())
                .or_default()
                .insert(id.clone());
        }
        if let Some(device_id) = &entry.info.device_id {
            self.by_device
                .entry(device_id.clone())
                .or_default()
                .insert(id.clone());
        }
        self.connections.insert(id, entry);
    }

    fn remove(&mut self, id: &ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(id)?;

        if let Some(user_id) = &entry.info.user_id {
            if let Some(set) = self.by_user.get_mut(user_id) {
                set.remove(id);
                if set.is_empty() {
                    self.by_user.remove(user_id);
                }
            }
        }
        if let Some(device_id) = &entry.info.device_id {
            if let Some(set) = self.by_device.get_mut(device_id) {
                set.remove(id);
                if set.is_empty() {
                    self.by_device.remove(device_id);
                }
            }
        }

        Some(entry)
    }
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

/// The connection registry.
pub struct ConnectionRegistry {
    inner: RwLock<Indexes>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating connection registry with config: {:?}", config);
        Self {
            inner: RwLock::new(Indexes::default()),
            config,
        }
    }

    /// Get the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a connection.
    ///
    /// Empty IDs count as absent. When a device ID is given, every other
    /// connection bound to that device is unregistered and closed before
    /// this returns. Registering an ID that is already present replaces the
    /// old entry without closing it, since both refer to the same socket.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBinding`] if both IDs are absent.
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: Option<UserId>,
        device_id: Option<DeviceId>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<Registered, RegistryError> {
        let user_id = non_empty(user_id);
        let device_id = non_empty(device_id);

        if user_id.is_none() && device_id.is_none() {
            return Err(RegistryError::InvalidBinding(id));
        }

        let connection = Connection {
            id: id.clone(),
            user_id,
            device_id,
            connected_at: unix_millis(),
            last_activity: Instant::now(),
            active_chat: None,
        };

        let superseded = {
            let mut inner = self.inner.write();

            let active_chat = inner.remove(&id).and_then(|old| old.info.active_chat);

            let mut superseded = Vec::new();
            if let Some(device_id) = &connection.device_id {
                let bound: Vec<ConnectionId> = inner
                    .by_device
                    .get(device_id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for old_id in bound {
                    if let Some(old) = inner.remove(&old_id) {
                        superseded.push(old);
                    }
                }
            }

            let mut info = connection.clone();
            info.active_chat = active_chat;
            inner.insert(Entry {
                info,
                sink: sink.clone(),
            });

            superseded
        };

        let mut replaced = Vec::with_capacity(superseded.len());
        for old in superseded {
            old.sink.close(CLOSE_REPLACED, "Replaced by new connection");
            info!(
                connection = %old.info.id,
                replaced_by = %id,
                device = ?connection.device_id,
                "Closed superseded device connection"
            );
            replaced.push(old.info.id);
        }

        debug!(
            connection = %id,
            user = ?connection.user_id,
            device = ?connection.device_id,
            "Connection registered"
        );

        Ok(Registered {
            connection,
            replaced,
        })
    }

    /// Record inbound activity.
    ///
    /// Returns `false` if the connection is unknown (already evicted).
    pub fn touch(&self, id: &ConnectionId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write();
        match inner.connections.get_mut(id) {
            Some(entry) => {
                entry.info.last_activity = entry.info.last_activity.max(now);
                true
            }
            None => false,
        }
    }

    /// Remove a connection from all indexes.
    ///
    /// Idempotent: returns `None` if the connection was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let removed = self.inner.write().remove(id).map(|entry| entry.info);
        if removed.is_some() {
            debug!(connection = %id, "Connection unregistered");
        }
        removed
    }

    /// Record which chat a connection has open; `None` clears it.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn set_active_chat(&self, id: &ConnectionId, chat_id: Option<String>) -> bool {
        let mut inner = self.inner.write();
        match inner.connections.get_mut(id) {
            Some(entry) => {
                entry.info.active_chat = non_empty(chat_id);
                true
            }
            None => false,
        }
    }

    /// Get a snapshot of one connection.
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner
            .read()
            .connections
            .get(id)
            .map(|entry| entry.info.clone())
    }

    /// Get a snapshot of every connection bound to a user.
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Connection> {
        let inner = self.inner.read();
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id))
                    .map(|entry| entry.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check whether a device has a connection with recent activity.
    ///
    /// A connection that is registered but silent for longer than the
    /// liveness window does not count.
    #[must_use]
    pub fn is_device_live(&self, device_id: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.read();
        inner.by_device.get(device_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| inner.connections.get(id))
                .any(|entry| entry.info.idle_for(now) <= self.config.liveness_window)
        })
    }

    /// Get every device that is live by the rule of [`Self::is_device_live`].
    #[must_use]
    pub fn live_device_ids(&self) -> Vec<DeviceId> {
        let now = Instant::now();
        let inner = self.inner.read();
        let mut live: Vec<DeviceId> = inner
            .by_device
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id))
                    .any(|entry| entry.info.idle_for(now) <= self.config.liveness_window)
            })
            .map(|(device_id, _)| device_id.clone())
            .collect();
        live.sort();
        live
    }

    /// Get every user with at least one connection.
    #[must_use]
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.read().by_user.keys().cloned().collect();
        users.sort();
        users
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            connections: inner.connections.len(),
            users: inner.by_user.len(),
            devices: inner.by_device.len(),
        }
    }

    /// Get the sinks of every connection bound to a user.
    pub(crate) fn user_sinks(&self, user_id: &str) -> Vec<(ConnectionId, Arc<dyn ConnectionSink>)> {
        let inner = self.inner.read();
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id))
                    .map(|entry| (entry.info.id.clone(), entry.sink.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the sink of a device's current connection.
    pub(crate) fn device_sink(
        &self,
        device_id: &str,
    ) -> Option<(ConnectionId, Arc<dyn ConnectionSink>)> {
        let inner = self.inner.read();
        inner
            .by_device
            .get(device_id)?
            .iter()
            .filter_map(|id| inner.connections.get(id))
            .max_by_key(|entry| entry.info.last_activity)
            .map(|entry| (entry.info.id.clone(), entry.sink.clone()))
    }

    /// Get the sinks of every connection matching `filter`.
    pub(crate) fn sinks_where<F>(&self, filter: F) -> Vec<(ConnectionId, Arc<dyn ConnectionSink>)>
    where
        F: Fn(&Connection) -> bool,
    {
        self.inner
            .read()
            .connections
            .values()
            .filter(|entry| filter(&entry.info))
            .map(|entry| (entry.info.id.clone(), entry.sink.clone()))
            .collect()
    }

    /// Evict every connection idle for longer than the idle timeout.
    ///
    /// Evicted connections are removed from all indexes and then closed.
    /// Returns the evicted IDs.
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let evicted: Vec<Entry> = {
            let mut inner = self.inner.write();
            let stale: Vec<ConnectionId> = inner
                .connections
                .values()
                .filter(|entry| entry.info.idle_for(now) > self.config.idle_timeout)
                .map(|entry| entry.info.id.clone())
                .collect();
            stale.iter().filter_map(|id| inner.remove(id)).collect()
        };

        evicted
            .into_iter()
            .map(|entry| {
                entry.sink.close(CLOSE_IDLE, "Idle timeout");
                info!(
                    connection = %entry.info.id,
                    user = ?entry.info.user_id,
                    device = ?entry.info.device_id,
                    idle_secs = entry.info.idle_for(now).as_secs(),
                    "Evicted idle connection"
                );
                entry.info.id
            })
            .collect()
    }

    /// Run [`Self::sweep_idle`] on the configured interval until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        spawn_periodic("idle-sweep", self.config.sweep_interval, token, move || {
            let registry = registry.clone();
            async move {
                registry.sweep_idle();
            }
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sink() -> (Arc<dyn ConnectionSink>, UnboundedReceiver<Outbound>) {
        let (sink, rx) = ChannelSink::new();
        (Arc::new(sink), rx)
    }

    fn register(
        registry: &ConnectionRegistry,
        id: &str,
        user: Option<&str>,
        device: Option<&str>,
    ) -> UnboundedReceiver<Outbound> {
        let (sink, rx) = sink();
        registry
            .register(
                id.into(),
                user.map(String::from),
                device.map(String::from),
                sink,
            )
            .unwrap();
        rx
    }

    #[test]
    fn test_register_requires_identity() {
        let registry = ConnectionRegistry::new();
        let (sink, _rx) = sink();

        let result = registry.register("conn-1".into(), None, Some("  ".into()), sink);
        assert!(matches!(result, Err(RegistryError::InvalidBinding(_))));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_device_binding_is_exclusive() {
        let registry = ConnectionRegistry::new();

        let mut first = register(&registry, "conn-1", None, Some("kiosk-1"));
        let (sink, _second) = sink();
        let registered = registry
            .register("conn-2".into(), None, Some("kiosk-1".into()), sink)
            .unwrap();

        assert_eq!(registered.replaced, vec![ConnectionId::from("conn-1")]);
        assert_eq!(
            first.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "Replaced by new connection".into()
            }
        );
        assert!(registry.connection(&"conn-1".into()).is_none());
        assert!(registry.is_device_live("kiosk-1"));
        assert_eq!(registry.live_device_ids(), vec!["kiosk-1".to_string()]);
        assert_eq!(registry.stats().devices, 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_user_binding_is_shared() {
        let registry = ConnectionRegistry::new();
        let _a = register(&registry, "tab-1", Some("user-1"), None);
        let _b = register(&registry, "tab-2", Some("user-1"), None);
        let _c = register(&registry, "phone", Some("user-1"), Some("phone-1"));

        assert_eq!(registry.connections_for_user("user-1").len(), 3);

        registry.unregister(&"tab-1".into());
        assert_eq!(registry.connections_for_user("user-1").len(), 2);
        registry.unregister(&"tab-2".into());
        registry.unregister(&"phone".into());

        assert!(registry.connections_for_user("user-1").is_empty());
        assert!(registry.connected_users().is_empty());
        assert_eq!(
            registry.stats(),
            RegistryStats {
                connections: 0,
                users: 0,
                devices: 0
            }
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let _rx = register(&registry, "conn-1", Some("user-1"), None);

        assert!(registry.unregister(&"conn-1".into()).is_some());
        assert!(registry.unregister(&"conn-1".into()).is_none());
        assert!(!registry.touch(&"conn-1".into()));
    }

    #[test]
    fn test_reregister_same_id_keeps_socket_open() {
        let registry = ConnectionRegistry::new();
        let mut rx = register(&registry, "conn-1", Some("user-1"), Some("kiosk-1"));
        registry.set_active_chat(&"conn-1".into(), Some("chat-9".into()));

        let (sink, _rx2) = sink();
        let registered = registry
            .register("conn-1".into(), Some("user-1".into()), Some("kiosk-1".into()), sink)
            .unwrap();

        assert!(registered.replaced.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.connection_count(), 1);
        let connection = registry.connection(&"conn-1".into()).unwrap();
        assert_eq!(connection.active_chat.as_deref(), Some("chat-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_decays_without_activity() {
        let registry = ConnectionRegistry::new();
        let _rx = register(&registry, "conn-1", None, Some("kiosk-1"));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(registry.is_device_live("kiosk-1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!registry.is_device_live("kiosk-1"));
        assert!(registry.live_device_ids().is_empty());
        assert!(registry.connection(&"conn-1".into()).is_some());

        assert!(registry.touch(&"conn-1".into()));
        assert!(registry.is_device_live("kiosk-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_connections() {
        let registry = ConnectionRegistry::new();
        let mut idle = register(&registry, "idle", Some("user-1"), None);
        let _busy = register(&registry, "busy", Some("user-2"), None);

        tokio::time::advance(Duration::from_secs(200)).await;
        registry.touch(&"busy".into());
        tokio::time::advance(Duration::from_secs(101)).await;

        let evicted = registry.sweep_idle();
        assert_eq!(evicted, vec![ConnectionId::from("idle")]);
        assert_eq!(
            idle.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_IDLE,
                reason: "Idle timeout".into()
            }
        );
        assert_eq!(registry.connected_users(), vec!["user-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_evicts() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _rx = register(&registry, "conn-1", Some("user-1"), None);
        let token = CancellationToken::new();
        let handle = registry.spawn_sweeper(token.clone());

        tokio::time::sleep(Duration::from_secs(6 * 60 + 1)).await;
        assert_eq!(registry.connection_count(), 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_concurrent_device_registration_leaves_one() {
        let registry = Arc::new(ConnectionRegistry::new());

        std::thread::scope(|scope| {
            for i in 0..16 {
                let registry = registry.clone();
                scope.spawn(move || {
                    let (sink, _rx) = ChannelSink::new();
                    registry
                        .register(
                            ConnectionId::new(format!("conn-{i}")),
                            Some(format!("user-{i}")),
                            Some("shared-device".into()),
                            Arc::new(sink),
                        )
                        .unwrap();
                });
            }
        });

        let stats = registry.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.devices, 1);
        assert_eq!(stats.users, 1);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }
}
