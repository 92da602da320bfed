//! HTTP-backed delivery transports.
//!
//! The bot transport talks to the Telegram Bot API; the mailer posts JSON to
//! an HTTP mail relay. Both are optional and only built when configured.

use crate::config::{EmailConfig, TelegramConfig};
use async_trait::async_trait;
use herald_core::{BotTransport, DeliveryError, EmailTransport, Recipient};
use herald_protocol::Notification;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Telegram bot delivery.
pub struct TelegramBot {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

#[derive(Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramBot {
    /// Build a bot from config; `None` without a token.
    #[must_use]
    pub fn from_config(config: &TelegramConfig) -> Option<Self> {
        let token = config.bot_token.as_deref().filter(|t| !t.trim().is_empty())?;
        Some(Self::new(&config.api_base, token))
    }

    /// Create a bot for an API base URL and token.
    #[must_use]
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            client: http_client(),
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
        }
    }
}

/// Text of a bot message for a notification.
fn bot_text(notification: &Notification) -> String {
    format!("🔔 {}\n\n{}", notification.title, notification.message)
}

/// Map a failed Bot API reply to a delivery error.
fn bot_error(status: u16, description: &str, chat_id: &str) -> DeliveryError {
    if description.to_ascii_lowercase().contains("chat not found") {
        DeliveryError::ChatNotFound(chat_id.to_string())
    } else if (400..500).contains(&status) {
        DeliveryError::Rejected(format!("{status}: {description}"))
    } else {
        DeliveryError::Transport(format!("{status}: {description}"))
    }
}

#[async_trait]
impl BotTransport for TelegramBot {
    async fn send_notification(
        &self,
        notification: &Notification,
        chat_id: &str,
    ) -> Result<(), DeliveryError> {
        let body = SendMessage {
            chat_id,
            text: bot_text(notification),
            parse_mode: "Markdown",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let reply: BotReply = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("Invalid bot reply: {}", e)))?;

        if reply.ok {
            debug!(notification = %notification.id, chat = %chat_id, "Bot message sent");
            return Ok(());
        }

        Err(bot_error(
            status.as_u16(),
            reply.description.as_deref().unwrap_or("unknown error"),
            chat_id,
        ))
    }
}

/// Email delivery through an HTTP relay.
pub struct HttpMailer {
    client: reqwest::Client,
    relay_url: Option<String>,
    api_key: Option<String>,
    from: String,
}

#[derive(Debug, Serialize)]
struct OutboundMail<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: String,
}

impl HttpMailer {
    /// Build a mailer from config; `None` when email is disabled.
    #[must_use]
    pub fn from_config(config: &EmailConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            client: http_client(),
            relay_url: config.relay_url.clone().filter(|u| !u.trim().is_empty()),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        })
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn mail_html(notification: &Notification) -> String {
    format!(
        "<h2>{}</h2><p>{}</p>",
        escape_html(&notification.title),
        escape_html(&notification.message).replace('\n', "<br>")
    )
}

#[async_trait]
impl EmailTransport for HttpMailer {
    async fn send(
        &self,
        notification: &Notification,
        recipient: &Recipient,
    ) -> Result<(), DeliveryError> {
        let Some(url) = &self.relay_url else {
            return Err(DeliveryError::Rejected("mail relay not configured".into()));
        };
        let Some(to) = recipient.email.as_deref() else {
            return Err(DeliveryError::Rejected("recipient has no email".into()));
        };

        let mail = OutboundMail {
            from: &self.from,
            to,
            subject: &notification.title,
            text: &notification.message,
            html: mail_html(notification),
        };

        let mut request = self.client.post(url).json(&mail);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(notification = %notification.id, "Email handed to relay");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(DeliveryError::Rejected(format!("{}: {}", status, body)))
        } else {
            Err(DeliveryError::Transport(format!("{}: {}", status, body)))
        }
    }

    fn is_configured(&self) -> bool {
        self.relay_url.is_some()
    }
}
