//! Notification dispatch.
//!
//! A notification is persisted first and delivered second. Delivery runs one
//! attempt per requested channel, concurrently, and every attempt ends in a
//! [`ChannelOutcome`]; no channel failure reaches the caller of
//! [`NotificationDispatcher::create`].

use crate::gateway::PresenceGateway;
use crate::store::{
    BotTransport, DeliveryError, EmailTransport, NewNotification, NotificationStore, Recipient,
    StoreError,
};
use crate::sweeper::spawn_periodic;
use crate::unix_millis;
use herald_protocol::{Channel, Notification, NotificationEvent, ServerEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The notification requested no delivery channel.
    #[error("Notification must request at least one channel")]
    EmptyChannels,

    /// The receiver is missing or unknown.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// No such notification for this receiver.
    #[error("Notification not found")]
    NotFoundOrNotOwner,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How one channel's delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Handed to the transport.
    Delivered,
    /// Not attempted; carries the reason.
    Skipped(&'static str),
    /// Attempted and failed; carries the error.
    Failed(String),
}

/// Per-channel outcomes of one delivery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    outcomes: BTreeMap<Channel, ChannelOutcome>,
}

impl DeliveryReport {
    /// Get the outcome of one channel, if it was requested.
    #[must_use]
    pub fn outcome(&self, channel: Channel) -> Option<&ChannelOutcome> {
        self.outcomes.get(&channel)
    }

    /// Iterate over every requested channel's outcome.
    pub fn iter(&self) -> impl Iterator<Item = (&Channel, &ChannelOutcome)> {
        self.outcomes.iter()
    }

    /// Count the channels that were delivered.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| **o == ChannelOutcome::Delivered)
            .count()
    }

    fn record(&mut self, channel: Channel, outcome: Option<ChannelOutcome>) {
        if let Some(outcome) = outcome {
            self.outcomes.insert(channel, outcome);
        }
    }
}

/// Persists notifications and delivers them over the requested channels.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    gateway: Arc<PresenceGateway>,
    email: Option<Arc<dyn EmailTransport>>,
    bot: Option<Arc<dyn BotTransport>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher with in-app delivery only.
    #[must_use]
    pub fn new(store: Arc<dyn NotificationStore>, gateway: Arc<PresenceGateway>) -> Self {
        Self {
            store,
            gateway,
            email: None,
            bot: None,
        }
    }

    /// Enable email delivery.
    #[must_use]
    pub fn with_email(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(transport);
        self
    }

    /// Enable bot delivery.
    #[must_use]
    pub fn with_bot(mut self, transport: Arc<dyn BotTransport>) -> Self {
        self.bot = Some(transport);
        self
    }

    /// Get the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Persist a notification and start delivering it in the background.
    ///
    /// Returns as soon as the record is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the store rejects the record.
    /// Delivery failures are never reported here.
    pub async fn create(&self, request: NewNotification) -> Result<Notification, DispatchError> {
        let notification = self.persist(request).await?;

        let dispatcher = self.clone();
        let record = notification.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&record).await;
        });

        Ok(notification)
    }

    /// Persist a notification and wait for every channel attempt.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create`].
    pub async fn create_and_deliver(
        &self,
        request: NewNotification,
    ) -> Result<(Notification, DeliveryReport), DispatchError> {
        let notification = self.persist(request).await?;
        let report = self.deliver(&notification).await;
        Ok((notification, report))
    }

    /// Run delivery for a stored notification.
    pub async fn deliver(&self, notification: &Notification) -> DeliveryReport {
        let recipient = self
            .store
            .recipient(&notification.receiver_id)
            .await
            .map_err(|e| e.to_string());

        let in_app = async {
            notification
                .wants(Channel::InApp)
                .then(|| self.deliver_in_app(notification))
        };
        let email = async {
            if notification.wants(Channel::Email) {
                Some(self.deliver_email(notification, &recipient).await)
            } else {
                None
            }
        };
        let telegram = async {
            if notification.wants(Channel::Telegram) {
                Some(self.deliver_telegram(notification, &recipient).await)
            } else {
                None
            }
        };

        let (in_app, email, telegram) = tokio::join!(in_app, email, telegram);

        let mut report = DeliveryReport::default();
        report.record(Channel::InApp, in_app);
        report.record(Channel::Email, email);
        report.record(Channel::Telegram, telegram);

        debug!(
            notification = %notification.id,
            receiver = %notification.receiver_id,
            delivered = report.delivered(),
            requested = notification.channels.len(),
            "Notification dispatched"
        );

        report
    }

    /// Mark one notification read.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFoundOrNotOwner`] unless the notification
    /// exists and `user_id` is its receiver.
    pub async fn mark_as_read(&self, id: &str, user_id: &str) -> Result<Notification, DispatchError> {
        self.store
            .mark_read(id, user_id)
            .await?
            .ok_or(DispatchError::NotFoundOrNotOwner)
    }

    /// Mark every notification of a user read. Returns how many changed.
    pub async fn mark_all_as_read(&self, user_id: &str) -> Result<u64, DispatchError> {
        Ok(self.store.mark_all_read(user_id).await?)
    }

    /// Count a user's unread notifications.
    pub async fn unread_count(&self, user_id: &str) -> Result<u64, DispatchError> {
        Ok(self.store.unread_count(user_id).await?)
    }

    /// List a user's notifications, newest first.
    pub async fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, DispatchError> {
        Ok(self.store.list(user_id, unread_only, limit).await?)
    }

    /// Delete every expired notification. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, DispatchError> {
        let removed = self.store.delete_expired(unix_millis()).await?;
        if removed > 0 {
            info!(removed, "Deleted expired notifications");
        }
        Ok(removed)
    }

    /// Run [`Self::cleanup_expired`] every `every` until cancelled.
    pub fn spawn_cleanup(&self, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        spawn_periodic("notification-cleanup", every, token, move || {
            let dispatcher = dispatcher.clone();
            async move {
                if let Err(e) = dispatcher.cleanup_expired().await {
                    error!("Expired notification cleanup failed: {}", e);
                }
            }
        })
    }

    async fn persist(&self, mut request: NewNotification) -> Result<Notification, DispatchError> {
        if request.channels.is_empty() {
            return Err(DispatchError::EmptyChannels);
        }
        let mut seen = Vec::with_capacity(request.channels.len());
        request.channels.retain(|c| {
            let first = !seen.contains(c);
            seen.push(*c);
            first
        });

        let receiver = request.receiver_id.trim();
        if receiver.is_empty() {
            return Err(DispatchError::InvalidRecipient("receiver ID is empty".into()));
        }
        if receiver.len() != request.receiver_id.len() {
            request.receiver_id = receiver.to_string();
        }
        if self.store.recipient(&request.receiver_id).await?.is_none() {
            return Err(DispatchError::InvalidRecipient(request.receiver_id.clone()));
        }

        let notification = self.store.insert(request).await?;
        debug!(
            notification = %notification.id,
            receiver = %notification.receiver_id,
            channels = ?notification.channels,
            "Notification stored"
        );
        Ok(notification)
    }

    fn deliver_in_app(&self, notification: &Notification) -> ChannelOutcome {
        let event = ServerEvent::Notification(NotificationEvent {
            notification: notification.clone(),
            sent_at: unix_millis(),
        });
        if self.gateway.send_to_user(&notification.receiver_id, &event) {
            ChannelOutcome::Delivered
        } else {
            ChannelOutcome::Skipped("receiver not connected")
        }
    }

    async fn deliver_email(
        &self,
        notification: &Notification,
        recipient: &Result<Option<Recipient>, String>,
    ) -> ChannelOutcome {
        let recipient = match recipient {
            Ok(Some(recipient)) => recipient,
            Ok(None) => return ChannelOutcome::Skipped("unknown recipient"),
            Err(e) => return self.failed(notification, Channel::Email, e.clone()),
        };
        if !recipient.accepts_email() {
            return ChannelOutcome::Skipped("no email address or email disabled");
        }
        let Some(transport) = self.email.as_ref().filter(|t| t.is_configured()) else {
            return ChannelOutcome::Skipped("email not configured");
        };

        match transport.send(notification, recipient).await {
            Ok(()) => ChannelOutcome::Delivered,
            Err(e) => self.failed(notification, Channel::Email, e.to_string()),
        }
    }

    async fn deliver_telegram(
        &self,
        notification: &Notification,
        recipient: &Result<Option<Recipient>, String>,
    ) -> ChannelOutcome {
        let recipient = match recipient {
            Ok(Some(recipient)) => recipient,
            Ok(None) => return ChannelOutcome::Skipped("unknown recipient"),
            Err(e) => return self.failed(notification, Channel::Telegram, e.clone()),
        };
        let Some(chat_id) = recipient.telegram_chat_id.as_deref() else {
            return ChannelOutcome::Skipped("no linked chat");
        };
        let Some(bot) = &self.bot else {
            return ChannelOutcome::Skipped("bot not configured");
        };

        match bot.send_notification(notification, chat_id).await {
            Ok(()) => ChannelOutcome::Delivered,
            Err(e @ DeliveryError::ChatNotFound(_)) => {
                if let Err(unlink) = self.store.unlink_telegram(chat_id).await {
                    error!(chat = %chat_id, "Failed to unlink missing chat: {}", unlink);
                } else {
                    info!(chat = %chat_id, receiver = %recipient.user_id, "Unlinked missing chat");
                }
                self.failed(notification, Channel::Telegram, e.to_string())
            }
            Err(e) => self.failed(notification, Channel::Telegram, e.to_string()),
        }
    }

    fn failed(&self, notification: &Notification, channel: Channel, reason: String) -> ChannelOutcome {
        warn!(
            notification = %notification.id,
            receiver = %notification.receiver_id,
            channel = %channel,
            "Channel delivery failed: {}",
            reason
        );
        ChannelOutcome::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Handshake;
    use crate::memory::MemoryStore;
    use crate::registry::ConnectionRegistry;
    use crate::sink::{ChannelSink, Outbound};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct Mailer {
        sent: Mutex<Vec<String>>,
        fail: bool,
        unconfigured: bool,
    }

    #[async_trait]
    impl EmailTransport for Mailer {
        async fn send(&self, notification: &Notification, recipient: &Recipient) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Transport("relay unreachable".into()));
            }
            self.sent
                .lock()
                .push(format!("{}:{}", recipient.email.clone().unwrap_or_default(), notification.title));
            Ok(())
        }

        fn is_configured(&self) -> bool {
            !self.unconfigured
        }
    }

    #[derive(Default)]
    struct Bot {
        sent: Mutex<Vec<String>>,
        missing_chat: bool,
    }

    #[async_trait]
    impl BotTransport for Bot {
        async fn send_notification(&self, _: &Notification, chat_id: &str) -> Result<(), DeliveryError> {
            if self.missing_chat {
                return Err(DeliveryError::ChatNotFound(chat_id.to_string()));
            }
            self.sent.lock().push(chat_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<PresenceGateway>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture(recipients: impl IntoIterator<Item = Recipient>) -> Fixture {
        let store = Arc::new(MemoryStore::with_recipients(recipients));
        let gateway = Arc::new(PresenceGateway::new(Arc::new(ConnectionRegistry::new())));
        let dispatcher = NotificationDispatcher::new(store.clone(), gateway.clone());
        Fixture {
            store,
            gateway,
            dispatcher,
        }
    }

    fn full_recipient(user_id: &str) -> Recipient {
        Recipient {
            email: Some(format!("{user_id}@example.com")),
            telegram_chat_id: Some("chat-42".into()),
            ..Recipient::new(user_id)
        }
    }

    fn connect(gateway: &PresenceGateway, id: &str, user: &str) -> UnboundedReceiver<Outbound> {
        let (sink, mut rx) = ChannelSink::new();
        gateway
            .connect(Handshake::new(id.into(), Some(user.into()), None), Arc::new(sink))
            .unwrap();
        rx.try_recv().unwrap();
        rx
    }

    #[tokio::test]
    async fn test_missing_email_does_not_affect_in_app() {
        let f = fixture([Recipient::new("user-1")]);
        let mut rx = connect(&f.gateway, "conn-1", "user-1");

        let (notification, report) = f
            .dispatcher
            .create_and_deliver(NewNotification::new(
                "user-1",
                [Channel::InApp, Channel::Email],
                "Report ready",
                "Your export finished",
            ))
            .await
            .unwrap();

        assert!(!notification.read);
        assert_eq!(report.outcome(Channel::InApp), Some(&ChannelOutcome::Delivered));
        assert!(matches!(report.outcome(Channel::Email), Some(ChannelOutcome::Skipped(_))));
        assert_eq!(report.outcome(Channel::Telegram), None);

        match rx.try_recv().unwrap() {
            Outbound::Event(ServerEvent::Notification(event)) => {
                assert_eq!(event.notification, notification);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_receiver_still_gets_record() {
        let f = fixture([Recipient::new("user-1")]);
        assert_eq!(f.dispatcher.unread_count("user-1").await.unwrap(), 0);

        let (notification, report) = f
            .dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::InApp], "t", "m"))
            .await
            .unwrap();

        assert!(!notification.read);
        assert!(matches!(report.outcome(Channel::InApp), Some(ChannelOutcome::Skipped(_))));
        assert_eq!(f.dispatcher.unread_count("user-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_padded_receiver_id_is_normalized() {
        let f = fixture([Recipient::new("user-1")]);
        let mut rx = connect(&f.gateway, "conn-1", "user-1");

        let (notification, report) = f
            .dispatcher
            .create_and_deliver(NewNotification::new(" user-1 ", [Channel::InApp], "t", "m"))
            .await
            .unwrap();

        assert_eq!(notification.receiver_id, "user-1");
        assert_eq!(f.store.get(&notification.id).unwrap().receiver_id, "user-1");
        assert_eq!(report.outcome(Channel::InApp), Some(&ChannelOutcome::Delivered));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Event(ServerEvent::Notification(_))
        ));
        assert_eq!(f.dispatcher.unread_count("user-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_delivers_in_background() {
        let f = fixture([Recipient::new("user-1")]);
        let mut rx = connect(&f.gateway, "conn-1", "user-1");

        let notification = f
            .dispatcher
            .create(NewNotification::new("user-1", [Channel::InApp], "Hello", "World"))
            .await
            .unwrap();

        match rx.recv().await {
            Some(Outbound::Event(ServerEvent::Notification(event))) => {
                assert_eq!(event.notification.id, notification.id);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_channel_is_isolated() {
        let f = fixture([full_recipient("user-1")]);
        let bot = Arc::new(Bot::default());
        let dispatcher = f
            .dispatcher
            .clone()
            .with_email(Arc::new(Mailer {
                fail: true,
                ..Mailer::default()
            }))
            .with_bot(bot.clone());

        let (notification, report) = dispatcher
            .create_and_deliver(NewNotification::new(
                "user-1",
                [Channel::Email, Channel::Telegram],
                "t",
                "m",
            ))
            .await
            .unwrap();

        assert!(matches!(report.outcome(Channel::Email), Some(ChannelOutcome::Failed(_))));
        assert_eq!(report.outcome(Channel::Telegram), Some(&ChannelOutcome::Delivered));
        assert_eq!(*bot.sent.lock(), vec!["chat-42".to_string()]);
        assert!(f.store.get(&notification.id).is_some());
    }

    #[tokio::test]
    async fn test_email_respects_preference_and_configuration() {
        let f = fixture([
            Recipient {
                email_notifications: Some(false),
                ..full_recipient("opted-out")
            },
            full_recipient("user-1"),
        ]);
        let mailer = Arc::new(Mailer::default());
        let dispatcher = f.dispatcher.clone().with_email(mailer.clone());

        let (_, report) = dispatcher
            .create_and_deliver(NewNotification::new("opted-out", [Channel::Email], "t", "m"))
            .await
            .unwrap();
        assert!(matches!(report.outcome(Channel::Email), Some(ChannelOutcome::Skipped(_))));

        let (_, report) = dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::Email], "Welcome", "m"))
            .await
            .unwrap();
        assert_eq!(report.outcome(Channel::Email), Some(&ChannelOutcome::Delivered));
        assert_eq!(*mailer.sent.lock(), vec!["user-1@example.com:Welcome".to_string()]);

        let unconfigured = f.dispatcher.clone().with_email(Arc::new(Mailer {
            unconfigured: true,
            ..Mailer::default()
        }));
        let (_, report) = unconfigured
            .create_and_deliver(NewNotification::new("user-1", [Channel::Email], "t", "m"))
            .await
            .unwrap();
        assert_eq!(report.outcome(Channel::Email), Some(&ChannelOutcome::Skipped("email not configured")));
    }

    #[tokio::test]
    async fn test_missing_chat_is_unlinked() {
        let f = fixture([full_recipient("user-1")]);
        let dispatcher = f.dispatcher.clone().with_bot(Arc::new(Bot {
            missing_chat: true,
            ..Bot::default()
        }));

        let (_, report) = dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::Telegram], "t", "m"))
            .await
            .unwrap();

        assert!(matches!(report.outcome(Channel::Telegram), Some(ChannelOutcome::Failed(_))));
        let recipient = f.store.recipient("user-1").await.unwrap().unwrap();
        assert!(recipient.telegram_chat_id.is_none());

        let (_, report) = dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::Telegram], "t", "m"))
            .await
            .unwrap();
        assert_eq!(report.outcome(Channel::Telegram), Some(&ChannelOutcome::Skipped("no linked chat")));
    }

    #[tokio::test]
    async fn test_validation() {
        let f = fixture([Recipient::new("user-1")]);

        let empty = NewNotification::new("user-1", Vec::new(), "t", "m");
        assert!(matches!(f.dispatcher.create(empty).await, Err(DispatchError::EmptyChannels)));

        let unknown = NewNotification::new("ghost", [Channel::InApp], "t", "m");
        assert!(matches!(
            f.dispatcher.create(unknown).await,
            Err(DispatchError::InvalidRecipient(_))
        ));

        let blank = NewNotification::new(" ", [Channel::InApp], "t", "m");
        assert!(matches!(
            f.dispatcher.create(blank).await,
            Err(DispatchError::InvalidRecipient(_))
        ));

        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_channels_collapse() {
        let f = fixture([Recipient::new("user-1")]);

        let (notification, report) = f
            .dispatcher
            .create_and_deliver(NewNotification::new(
                "user-1",
                [Channel::Telegram, Channel::InApp, Channel::Telegram],
                "t",
                "m",
            ))
            .await
            .unwrap();

        assert_eq!(notification.channels, vec![Channel::Telegram, Channel::InApp]);
        assert_eq!(report.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_mark_as_read_requires_owner() {
        let f = fixture([Recipient::new("user-1"), Recipient::new("user-2")]);
        let (first, _) = f
            .dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::InApp], "a", "m"))
            .await
            .unwrap();
        f.dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::InApp], "b", "m"))
            .await
            .unwrap();

        assert!(matches!(
            f.dispatcher.mark_as_read(&first.id, "user-2").await,
            Err(DispatchError::NotFoundOrNotOwner)
        ));
        assert!(matches!(
            f.dispatcher.mark_as_read("missing", "user-1").await,
            Err(DispatchError::NotFoundOrNotOwner)
        ));

        let read = f.dispatcher.mark_as_read(&first.id, "user-1").await.unwrap();
        assert!(read.read);
        assert_eq!(f.dispatcher.unread_count("user-1").await.unwrap(), 1);
        assert_eq!(f.dispatcher.list("user-1", true, 10).await.unwrap().len(), 1);

        assert_eq!(f.dispatcher.mark_all_as_read("user-1").await.unwrap(), 1);
        assert_eq!(f.dispatcher.unread_count("user-1").await.unwrap(), 0);
        assert_eq!(f.dispatcher.list("user-1", false, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let f = fixture([Recipient::new("user-1")]);
        let now = unix_millis();
        for expires in [now.saturating_sub(1_000), now + 3_600_000] {
            f.dispatcher
                .create_and_deliver(NewNotification::new("user-1", [Channel::InApp], "t", "m").expires_at(expires))
                .await
                .unwrap();
        }
        f.dispatcher
            .create_and_deliver(NewNotification::new("user-1", [Channel::InApp], "t", "m"))
            .await
            .unwrap();

        assert_eq!(f.dispatcher.cleanup_expired().await.unwrap(), 1);
        assert_eq!(f.store.len(), 2);
        assert_eq!(f.dispatcher.cleanup_expired().await.unwrap(), 0);
    }
}
