//! Server configuration.
//!
//! Configuration is loaded from:
//! - The first TOML file found in the default paths
//! - Environment variables (`HERALD_*`, nested sections joined with `__`,
//!   e.g. `HERALD_PRESENCE__PING_TIMEOUT_MS=3000`)

use anyhow::{Context, Result};
use herald_core::{GatewayConfig, RegistryConfig, TypingScope};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Notification delivery configuration.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Rate limiter configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// How long a client without query IDs has to send `register`.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A device is live only with activity inside this window.
    #[serde(default = "default_liveness_window")]
    pub liveness_window_ms: u64,

    /// Connections idle longer than this are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Interval of the idle sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Bound for device pings.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Heartbeat interval advertised to clients.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Who receives typing indicators: `room` or `all`.
    #[serde(default)]
    pub typing_scope: TypingScope,
}

/// Notification delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Interval of the expired-notification cleanup.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Email relay.
    #[serde(default)]
    pub email: EmailConfig,

    /// Telegram bot.
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Email relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Enable email delivery.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint that accepts outbound mail as JSON.
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Bearer token for the relay.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Sender address.
    #[serde(default = "default_mail_from")]
    pub from: String,
}

/// Telegram bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token; bot delivery is disabled without one.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Bot API base URL.
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Interval of the expired-entry sweep.
    #[serde(default = "default_rate_limit_sweep")]
    pub sweep_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_liveness_window() -> u64 {
    120_000 // 2 minutes
}

fn default_idle_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_ping_timeout() -> u64 {
    1_500
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_cleanup_interval() -> u64 {
    3_600_000 // 1 hour
}

fn default_mail_from() -> String {
    "noreply@localhost".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_rate_limit_sweep() -> u64 {
    300_000 // 5 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            presence: PresenceConfig::default(),
            notifications: NotificationsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window_ms: default_liveness_window(),
            idle_timeout_ms: default_idle_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            ping_timeout_ms: default_ping_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            typing_scope: TypingScope::default(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            email: EmailConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: None,
            api_key: None,
            from: default_mail_from(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_rate_limit_sweep(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl PresenceConfig {
    /// Registry settings derived from this section.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            liveness_window: Duration::from_millis(self.liveness_window_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    /// Gateway settings derived from this section.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            typing_scope: self.typing_scope,
        }
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                tracing::debug!("Loading configuration from {}", expanded);
                builder = builder.add_source(config::File::new(
                    expanded.as_ref(),
                    config::FileFormat::Toml,
                ));
                break;
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Interval of the expired-notification cleanup.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.notifications.cleanup_interval_ms)
    }

    /// Interval of the rate limiter sweep.
    #[must_use]
    pub fn rate_limit_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit.sweep_interval_ms)
    }

    /// Time allowed for an explicit `register` message.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.presence.typing_scope, TypingScope::Room);
        assert!(!config.notifications.email.enabled);
        assert!(config.notifications.telegram.bot_token.is_none());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [presence]
            ping_timeout_ms = 3000
            typing_scope = "all"

            [notifications.telegram]
            bot_token = "123:abc"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.presence.idle_timeout_ms, 300_000);
        assert_eq!(config.notifications.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(config.notifications.telegram.api_base, "https://api.telegram.org");

        let gateway = config.presence.gateway_config();
        assert_eq!(gateway.ping_timeout, Duration::from_secs(3));
        assert_eq!(gateway.typing_scope, TypingScope::All);
    }

    #[test]
    fn test_registry_config_defaults() {
        let registry = PresenceConfig::default().registry_config();
        let expected = RegistryConfig::default();
        assert_eq!(registry.liveness_window, expected.liveness_window);
        assert_eq!(registry.idle_timeout, expected.idle_timeout);
        assert_eq!(registry.sweep_interval, expected.sweep_interval);
    }
}
