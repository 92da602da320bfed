//! In-memory [`NotificationStore`].
//!
//! Backs the server when no database collaborator is wired in, and the
//! dispatcher tests.

use crate::store::{NewNotification, NotificationStore, Recipient, StoreError};
use crate::unix_millis;
use async_trait::async_trait;
use herald_protocol::Notification;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct State {
    notifications: HashMap<String, Notification>,
    recipients: HashMap<String, Recipient>,
}

/// Notification store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a known set of recipients.
    #[must_use]
    pub fn with_recipients(recipients: impl IntoIterator<Item = Recipient>) -> Self {
        let store = Self::new();
        for recipient in recipients {
            store.upsert_recipient(recipient);
        }
        store
    }

    /// Add or replace a recipient.
    pub fn upsert_recipient(&self, recipient: Recipient) {
        self.state
            .write()
            .recipients
            .insert(recipient.user_id.clone(), recipient);
    }

    /// Get a stored record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Notification> {
        self.state.read().notifications.get(id).cloned()
    }

    /// Get the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().notifications.len()
    }

    /// Check whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().notifications.is_empty()
    }

    fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("ntf_{:x}_{:06}", unix_millis(), seq)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, new: NewNotification) -> Result<Notification, StoreError> {
        if new.channels.is_empty() {
            return Err(StoreError::Invalid("channel set is empty".into()));
        }

        let notification = Notification {
            id: self.next_id(),
            kind: new.kind,
            channels: new.channels,
            title: new.title,
            message: new.message,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            related_id: new.related_id,
            priority: new.priority,
            action: new.action,
            read: false,
            created_at: unix_millis(),
            expires_at: new.expires_at,
        };

        self.state
            .write()
            .notifications
            .insert(notification.id.clone(), notification.clone());

        Ok(notification)
    }

    async fn recipient(&self, user_id: &str) -> Result<Option<Recipient>, StoreError> {
        Ok(self.state.read().recipients.get(user_id).cloned())
    }

    async fn mark_read(
        &self,
        id: &str,
        receiver_id: &str,
    ) -> Result<Option<Notification>, StoreError> {
        let mut state = self.state.write();
        Ok(state
            .notifications
            .get_mut(id)
            .filter(|n| n.receiver_id == receiver_id)
            .map(|n| {
                n.read = true;
                n.clone()
            }))
    }

    async fn mark_all_read(&self, receiver_id: &str) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let mut changed = 0;
        for n in state.notifications.values_mut() {
            if n.receiver_id == receiver_id && !n.read {
                n.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn unread_count(&self, receiver_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .notifications
            .values()
            .filter(|n| n.receiver_id == receiver_id && !n.read)
            .count() as u64)
    }

    async fn list(
        &self,
        receiver_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut list: Vec<Notification> = self
            .state
            .read()
            .notifications
            .values()
            .filter(|n| n.receiver_id == receiver_id && (!unread_only || !n.read))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        list.truncate(limit);
        Ok(list)
    }

    async fn delete_expired(&self, now_ms: u64) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let before = state.notifications.len();
        state.notifications.retain(|_, n| !n.is_expired_at(now_ms));
        Ok((before - state.notifications.len()) as u64)
    }

    async fn unlink_telegram(&self, chat_id: &str) -> Result<(), StoreError> {
        for recipient in self.state.write().recipients.values_mut() {
            if recipient.telegram_chat_id.as_deref() == Some(chat_id) {
                recipient.telegram_chat_id = None;
            }
        }
        Ok(())
    }
}
