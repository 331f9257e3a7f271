use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, InboundUpdate},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Outbound side of the chat transport.
///
/// Delivery is fire-and-forget from the core's point of view: a failed send is
/// logged but never holds back the offset.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;
}

/// Inbound side of the chat transport (long polling).
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Block until updates with `id > after` arrive or `timeout` elapses.
    ///
    /// Safe to call repeatedly with a non-decreasing `after`.
    async fn fetch_updates(&self, after: i64, timeout: Duration) -> Result<Vec<InboundUpdate>>;
}
