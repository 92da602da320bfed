//! # herald-protocol
//!
//! Wire protocol definitions for the Herald presence and notification engine.
//!
//! Every real-time message is an event envelope `{"event": name, "data": {...}}`.
//! Text frames carry the envelope as JSON; binary frames carry it as
//! length-prefixed MessagePack.
//!
//! ## Event Types
//!
//! - Outbound: `connection_ack`, `notification`, `new_message`, `user_typing`,
//!   `access_updated`, `ping`
//! - Inbound: `register`, `heartbeat`, `pong`, `set_active_chat`, `user_typing`
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode_text(r#"{"event":"heartbeat"}"#).unwrap();
//! assert_eq!(event, ClientEvent::Heartbeat);
//! ```

pub mod codec;
pub mod events;
pub mod notification;

pub use codec::{decode_text, encode_text, ProtocolError};
pub use events::{
    ActiveChat, ChatMessage, ClientEvent, ConnectionAck, NotificationEvent, PingEvent, PongAck,
    Registration, ServerEvent, Typing, TypingEvent, PROTOCOL_VERSION,
};
pub use notification::{Channel, Notification, NotificationId, NotificationKind, Priority};
