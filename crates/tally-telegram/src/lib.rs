//! Telegram adapter (teloxide).
//!
//! This crate implements the `tally-core` messaging ports over the Telegram Bot API:
//! `TelegramMessenger` for replies and `TelegramUpdates` for long polling.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{AllowedUpdate, UpdateKind},
};

use tokio::time::sleep;

use tally_core::{
    domain::{ChatId, InboundMessage, InboundUpdate, UpdateId},
    errors::Error,
    messaging::{
        port::{MessagingPort, UpdateSource},
        types::MessagingCapabilities,
    },
    Result,
};

/// Slack added on top of the long-poll timeout for the HTTP client timeout.
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Build a bot whose HTTP client outlives a long poll of `poll_timeout`.
pub fn build_bot(token: &str, poll_timeout: Duration) -> Result<Bot> {
    let client: reqwest::Client = teloxide::net::default_reqwest_settings()
        .timeout(poll_timeout + HTTP_TIMEOUT_SLACK)
        .build()
        .map_err(|e| Error::Config(format!("failed to build telegram http client: {e}")))?;
    Ok(Bot::with_client(token, client))
}

/// `@username` of the bot behind `bot`.
pub async fn bot_username(bot: &Bot) -> Result<String> {
    let me = bot.get_me().await.map_err(map_err)?;
    Ok(format!("@{}", me.username()))
}

fn map_err(e: teloxide::RequestError) -> Error {
    Error::Transport(format!("telegram error: {e}"))
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::warn!(retry_after_ms = d.as_millis() as u64, "telegram rate limit");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: 4096,
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .send_message(Self::tg_chat(chat_id), text.to_string())
        })
        .await?;
        Ok(())
    }
}

/// Long-polling `getUpdates` source.
#[derive(Clone)]
pub struct TelegramUpdates {
    bot: Bot,
}

impl TelegramUpdates {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn fetch_updates(&self, after: i64, timeout: Duration) -> Result<Vec<InboundUpdate>> {
        // Telegram confirms everything below `offset`, so ask for `after + 1`.
        let offset = i32::try_from(after.saturating_add(1))
            .map_err(|_| Error::Transport(format!("update offset {after} out of range")))?;
        let timeout_secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);

        let updates = self
            .bot
            .get_updates()
            .offset(offset)
            .timeout(timeout_secs)
            .allowed_updates(vec![AllowedUpdate::Message])
            .await
            .map_err(map_err)?;

        tracing::debug!(count = updates.len(), offset, "polled telegram");
        Ok(updates.into_iter().map(to_inbound).collect())
    }
}

/// Keep the update id of everything; only plain text messages carry a payload.
fn to_inbound(update: Update) -> InboundUpdate {
    let id = UpdateId(i64::from(update.id));
    let message = match update.kind {
        UpdateKind::Message(msg) => msg.text().map(|text| InboundMessage {
            chat_id: ChatId(msg.chat.id.0),
            sender_name: msg.from().map(|u| u.full_name()).unwrap_or_default(),
            text: text.to_string(),
            timestamp: msg.date,
        }),
        _ => None,
    };
    InboundUpdate { id, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    const PRIVATE_MESSAGE: &str = r#"{
        "message_id": 1,
        "date": 1780306200,
        "chat": {"id": 42, "type": "private", "first_name": "Aroha"},
        "from": {"id": 42, "is_bot": false, "first_name": "Aroha", "last_name": "Ngata"},
        "text": "45.50 coffee"
    }"#;

    #[test]
    fn text_message_maps_to_inbound() {
        let u = update(&format!(r#"{{"update_id": 10, "message": {PRIVATE_MESSAGE}}}"#));
        let inbound = to_inbound(u);
        assert_eq!(inbound.id, UpdateId(10));
        let msg = inbound.message.unwrap();
        assert_eq!(msg.chat_id, ChatId(42));
        assert_eq!(msg.sender_name, "Aroha Ngata");
        assert_eq!(msg.text, "45.50 coffee");
        assert_eq!(msg.timestamp.timestamp(), 1780306200);
    }

    #[test]
    fn edited_message_is_acknowledged_without_payload() {
        let u = update(&format!(
            r#"{{"update_id": 11, "edited_message": {PRIVATE_MESSAGE}}}"#
        ));
        let inbound = to_inbound(u);
        assert_eq!(inbound.id, UpdateId(11));
        assert!(inbound.message.is_none());
    }
}
