//! Notification model shared by the dispatcher and the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A notification identifier, assigned by the store.
pub type NotificationId = String;

/// A notification delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Push over the user's live real-time connections.
    InApp,
    /// Email through the mail transport.
    Email,
    /// Message through the bot transport.
    Telegram,
}

impl Channel {
    /// All channels, in dispatch order.
    pub const ALL: [Channel; 3] = [Channel::InApp, Channel::Email, Channel::Telegram];

    /// Wire name of the channel.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "IN_APP",
            Channel::Email => "EMAIL",
            Channel::Telegram => "TELEGRAM",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Channel {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "IN_APP" => Ok(Channel::InApp),
            "EMAIL" => Ok(Channel::Email),
            "TELEGRAM" => Ok(Channel::Telegram),
            _ => Err("Invalid notification channel"),
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Notification type as shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// A durable notification record.
///
/// Records are immutable once dispatched, apart from `read` and removal on
/// expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Store-assigned identifier.
    pub id: NotificationId,
    /// Notification type.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Requested delivery channels (never empty).
    pub channels: Vec<Channel>,
    pub title: String,
    pub message: String,
    /// Sender user ID; `None` for system notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Receiver user ID.
    pub receiver_id: String,
    /// Related resource, e.g. the commented entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<String>,
    pub priority: Priority,
    /// Client-side action, e.g. `{"type": "NAVIGATE", "url": "/training"}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
    pub read: bool,
    /// Creation time, unix milliseconds.
    pub created_at: u64,
    /// Expiry time, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Notification {
    /// Check whether the notification requested a channel.
    #[must_use]
    pub fn wants(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// Check whether the notification has expired at `now_ms`.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(serde_json::to_string(&Channel::InApp).unwrap(), "\"IN_APP\"");
        assert_eq!(Channel::try_from("TELEGRAM"), Ok(Channel::Telegram));
        assert!(Channel::try_from("SMS").is_err());
    }

    #[test]
    fn test_notification_json_shape() {
        let notification = Notification {
            id: "ntf_1".into(),
            kind: NotificationKind::Warning,
            channels: vec![Channel::InApp, Channel::Email],
            title: "Storage".into(),
            message: "Less than 10% free".into(),
            sender_id: None,
            receiver_id: "user-1".into(),
            related_id: None,
            priority: Priority::High,
            action: None,
            read: false,
            created_at: 1_000,
            expires_at: Some(2_000),
        };

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["type"], "WARNING");
        assert_eq!(json["receiverId"], "user-1");
        assert_eq!(json["channels"][1], "EMAIL");
        assert!(json.get("senderId").is_none());

        assert!(!notification.is_expired_at(1_999));
        assert!(notification.is_expired_at(2_000));
        assert!(notification.wants(Channel::Email));
        assert!(!notification.wants(Channel::Telegram));
    }
}
