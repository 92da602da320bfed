//! Event types for the Herald protocol.
//!
//! Events are adjacently tagged: the variant name travels in `event`, the
//! body in `data`. Body fields are camelCase.

use crate::notification::Notification;
use serde::{Deserialize, Serialize};

/// Current protocol version, advertised in `connection_ack`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Events sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted.
    ConnectionAck(ConnectionAck),
    /// A durable notification pushed in-app.
    Notification(NotificationEvent),
    /// A chat message delivered without a notification record.
    NewMessage(ChatMessage),
    /// Another user started or stopped typing.
    UserTyping(TypingEvent),
    /// Generic fan-out after access rules changed.
    AccessUpdated(serde_json::Value),
    /// Server-initiated ping, answered with `pong`.
    Ping(PingEvent),
}

impl ServerEvent {
    /// Get the event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionAck(_) => "connection_ack",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::UserTyping(_) => "user_typing",
            ServerEvent::AccessUpdated(_) => "access_updated",
            ServerEvent::Ping(_) => "ping",
        }
    }
}

/// Body of `connection_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    /// Always `"connected"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub connection_id: String,
    /// Server time, unix milliseconds.
    pub timestamp: u64,
    /// Expected client heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    pub version: u8,
}

/// Body of `notification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(flatten)]
    pub notification: Notification,
    /// Push time, unix milliseconds.
    pub sent_at: u64,
}

/// Body of `new_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub chat_id: String,
    /// Opaque chat payload produced by the chat module.
    pub message: serde_json::Value,
}

/// Body of outbound `user_typing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub chat_id: String,
    pub typing: bool,
}

/// Body of `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingEvent {
    /// Echoed back in `pong`.
    pub id: u64,
    /// Server time, unix milliseconds.
    pub timestamp: u64,
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Identify the connection when the handshake query carried no IDs.
    Register(Registration),
    /// Keepalive.
    Heartbeat,
    /// Answer to a server `ping`, or a bare keepalive when `id` is absent.
    Pong(PongAck),
    /// Report which chat the connection has open.
    SetActiveChat(ActiveChat),
    /// Typing indicator.
    UserTyping(Typing),
}

impl ClientEvent {
    /// Get the event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => "register",
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::Pong(_) => "pong",
            ClientEvent::SetActiveChat(_) => "set_active_chat",
            ClientEvent::UserTyping(_) => "user_typing",
        }
    }
}

/// Body of `register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Body of `pong`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongAck {
    #[serde(default)]
    pub id: Option<u64>,
}

/// Body of `set_active_chat`; `chatId: null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveChat {
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Body of inbound `user_typing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub chat_id: String,
    pub typing: bool,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_envelope() {
        let event = ServerEvent::UserTyping(TypingEvent {
            user_id: "u1".into(),
            user_name: Some("Alice".into()),
            chat_id: "chat-7".into(),
            typing: true,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "user_typing",
                "data": {"userId": "u1", "userName": "Alice", "chatId": "chat-7", "typing": true}
            })
        );
        assert_eq!(event.name(), "user_typing");
    }

    #[test]
    fn test_client_event_parsing() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "set_active_chat",
            "data": {"chatId": null}
        }))
        .unwrap();
        assert_eq!(event, ClientEvent::SetActiveChat(ActiveChat { chat_id: None }));

        let event: ClientEvent = serde_json::from_value(json!({
            "event": "pong",
            "data": {"id": 9}
        }))
        .unwrap();
        assert_eq!(event, ClientEvent::Pong(PongAck { id: Some(9) }));
        assert_eq!(event.name(), "pong");
    }
}
