//! # herald-core
//!
//! Presence, notification delivery and rate limiting for the Herald engine.
//!
//! This crate provides the stateful building blocks:
//!
//! - **ConnectionRegistry** - Live connections indexed by connection, user and device
//! - **PresenceGateway** - Handshake, heartbeats, typing, chat rooms and device pings
//! - **NotificationDispatcher** - Persist once, then deliver per channel
//! - **RateLimiter** - Fixed-window counters and login lockout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌────────────────────┐
//! │  Transport  │────▶│ PresenceGateway │────▶│ ConnectionRegistry │
//! └─────────────┘     └─────────────────┘     └────────────────────┘
//!                              ▲
//!                              │ in-app
//!                     ┌────────────────────────┐     ┌────────────────────┐
//!                     │ NotificationDispatcher │────▶│ Store / Email / Bot │
//!                     └────────────────────────┘     └────────────────────┘
//! ```
//!
//! The transport never appears here directly. Each connection is registered
//! with a [`ConnectionSink`] and the core only ever queues events on it.

pub mod dispatcher;
pub mod gateway;
pub mod limiter;
pub mod memory;
pub mod registry;
pub mod sink;
pub mod store;
pub mod sweeper;

pub use dispatcher::{ChannelOutcome, DeliveryReport, DispatchError, NotificationDispatcher};
pub use gateway::{
    ChatDelivery, GatewayConfig, GatewayError, Handshake, PingOutcome, PresenceGateway,
    TypingScope,
};
pub use limiter::{LimitPolicy, LoginDecision, LoginPolicy, RateLimitDecision, RateLimiter};
pub use memory::MemoryStore;
pub use registry::{
    Connection, ConnectionId, ConnectionRegistry, DeviceId, RegistryConfig, RegistryError,
    RegistryStats, UserId,
};
pub use sink::{ChannelSink, ConnectionSink, Outbound, SinkError};
pub use store::{
    BotTransport, DeliveryError, EmailTransport, NewNotification, NotificationStore, Recipient,
    StoreError,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
