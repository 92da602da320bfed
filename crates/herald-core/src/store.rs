//! Collaborator interfaces for notification dispatch.
//!
//! The dispatcher owns no persistence and no outbound network clients. It is
//! handed a [`NotificationStore`] for records and recipient contact data, and
//! optionally an [`EmailTransport`] and a [`BotTransport`].

use async_trait::async_trait;
use herald_protocol::{Channel, Notification, NotificationKind, Priority};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unreachable or failed the query.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The record was rejected by the store.
    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Errors reported by a delivery transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The bot chat no longer exists; the link should be dropped.
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// The remote service refused the message.
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// Network or protocol failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A notification to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    pub channels: Vec<Channel>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub receiver_id: String,
    #[serde(default)]
    pub related_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub action: Option<serde_json::Value>,
    /// Expiry time, unix milliseconds.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl NewNotification {
    /// Create a notification with default type and priority.
    #[must_use]
    pub fn new(
        receiver_id: impl Into<String>,
        channels: impl IntoIterator<Item = Channel>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::default(),
            channels: channels.into_iter().collect(),
            title: title.into(),
            message: message.into(),
            sender_id: None,
            receiver_id: receiver_id.into(),
            related_id: None,
            priority: Priority::default(),
            action: None,
            expires_at: None,
        }
    }

    /// Set the sender.
    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// Set the notification type.
    #[must_use]
    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the related resource.
    #[must_use]
    pub fn with_related(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    /// Set the client-side action.
    #[must_use]
    pub fn with_action(mut self, action: serde_json::Value) -> Self {
        self.action = Some(action);
        self
    }

    /// Set the expiry time (unix milliseconds).
    #[must_use]
    pub fn expires_at(mut self, at_ms: u64) -> Self {
        self.expires_at = Some(at_ms);
        self
    }
}

/// Contact data and channel preferences of a receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Linked bot chat.
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    /// Stored email preference; `None` when the user never set one.
    #[serde(default)]
    pub email_notifications: Option<bool>,
}

impl Recipient {
    /// Create a recipient with no contact data.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Whether email may be sent: an address exists and email is not
    /// explicitly disabled.
    #[must_use]
    pub fn accepts_email(&self) -> bool {
        self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
            && self.email_notifications != Some(false)
    }
}

/// Durable notification records plus the user directory the dispatcher needs.
///
/// Ownership is part of the query: `mark_read` only matches a record whose
/// receiver is the given user.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new record and return it with its assigned ID.
    async fn insert(&self, notification: NewNotification) -> Result<Notification, StoreError>;

    /// Look up a receiver.
    async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, StoreError>;

    /// Mark one record read if it belongs to `receiver_id`.
    async fn mark_read(
        &self,
        id: &str,
        receiver_id: &str,
    ) -> Result<Option<Notification>, StoreError>;

    /// Mark every unread record of a receiver read; returns how many changed.
    async fn mark_all_read(&self, receiver_id: &str) -> Result<u64, StoreError>;

    /// Count unread records of a receiver.
    async fn unread_count(&self, receiver_id: &str) -> Result<u64, StoreError>;

    /// List a receiver's records, newest first.
    async fn list(
        &self,
        receiver_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Delete every record whose expiry is at or before `now_ms`.
    async fn delete_expired(&self, now_ms: u64) -> Result<u64, StoreError>;

    /// Drop a bot chat link that no longer exists.
    async fn unlink_telegram(&self, chat_id: &str) -> Result<(), StoreError>;
}

/// Outbound email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send a notification to the recipient's address.
    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError>;

    /// Whether the transport has what it needs to send.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Outbound bot messages.
#[async_trait]
pub trait BotTransport: Send + Sync {
    /// Send a notification to a bot chat.
    async fn send_notification(
        &self,
        notification: &Notification,
        chat_id: &str,
    ) -> Result<(), DeliveryError>;
}
