use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    audit::{AuditEvent, AuditLogger},
    commands::CommandDispatcher,
    config::Config,
    domain::{format_cents, InboundMessage, InboundUpdate, UpdateId},
    errors::{Error, Failure},
    linking::{LinkingService, TELEGRAM_PROVIDER},
    messaging::port::{MessagingPort, UpdateSource},
    offset::OffsetTracker,
    ports::LedgerStore,
    recorder::{Recorded, TransactionRecorder},
    Result,
};

const WELCOME_TEXT: &str = "Welcome to Tally! To link your account, use the 'Link Telegram' \
button in Settings on the web app, or send /start <code> with the code shown there.";

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Long-poll timeout handed to the transport.
    pub poll_timeout: Duration,
    /// Pause after a hard failure before polling again.
    pub retry_backoff: Duration,
    /// Provider name under which chat senders are linked.
    pub provider: String,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(2),
            provider: TELEGRAM_PROVIDER.to_string(),
        }
    }
}

/// Where an update was routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Link,
    Unregistered,
    Command,
    Expense,
}

impl Route {
    fn as_str(self) -> &'static str {
        match self {
            Route::Link => "link",
            Route::Unregistered => "unregistered",
            Route::Command => "command",
            Route::Expense => "expense",
        }
    }
}

/// Polls the transport and handles each update exactly once in a meaningful sense:
/// route, reply once, then advance the offset.
pub struct IngestionLoop {
    source: Arc<dyn UpdateSource>,
    messenger: Arc<dyn MessagingPort>,
    offsets: OffsetTracker,
    linking: LinkingService,
    recorder: TransactionRecorder,
    dispatcher: CommandDispatcher,
    audit: Option<AuditLogger>,
    settings: LoopSettings,
}

impl IngestionLoop {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        messenger: Arc<dyn MessagingPort>,
        offsets: OffsetTracker,
        linking: LinkingService,
        recorder: TransactionRecorder,
        dispatcher: CommandDispatcher,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            messenger,
            offsets,
            linking,
            recorder,
            dispatcher,
            audit: None,
            settings,
        }
    }

    /// Wire every component over one shared store handle.
    pub fn wire<S: LedgerStore + 'static>(
        store: Arc<S>,
        source: Arc<dyn UpdateSource>,
        messenger: Arc<dyn MessagingPort>,
        cfg: &Config,
    ) -> Self {
        let ingest = Self::new(
            source,
            messenger,
            OffsetTracker::new(store.clone()),
            LinkingService::new(store.clone()),
            TransactionRecorder::new(store.clone(), store.clone(), cfg.dedup_bucket),
            CommandDispatcher::new(store),
            LoopSettings {
                poll_timeout: cfg.poll_timeout,
                retry_backoff: cfg.retry_backoff,
                ..LoopSettings::default()
            },
        );
        match &cfg.audit_log_path {
            Some(path) => ingest.with_audit(AuditLogger::new(path.clone(), cfg.audit_log_json)),
            None => ingest,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Poll until `cancel` fires. Cancellation interrupts a pending poll but never an
    /// update that is already being handled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            poll_timeout_secs = self.settings.poll_timeout.as_secs(),
            "ingestion loop started"
        );

        while !cancel.is_cancelled() {
            let offset = match self.offsets.load().await {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load offset");
                    self.backoff(&cancel).await;
                    continue;
                }
            };

            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.source.fetch_updates(offset, self.settings.poll_timeout) => r,
            };
            let updates = match fetched {
                Ok(u) => u,
                Err(e) => {
                    tracing::warn!(error = %e, "polling failed");
                    self.backoff(&cancel).await;
                    continue;
                }
            };

            if let Err(e) = self.process_batch(offset, updates, &cancel).await {
                tracing::error!(error = %e, "update left unacknowledged; will retry");
                self.backoff(&cancel).await;
            }
        }

        tracing::info!("ingestion loop stopped");
        Ok(())
    }

    /// One poll + handle cycle. Returns how many updates were acknowledged.
    pub async fn poll_once(&self) -> Result<usize> {
        let offset = self.offsets.load().await?;
        let updates = self
            .source
            .fetch_updates(offset, self.settings.poll_timeout)
            .await?;
        self.process_batch(offset, updates, &CancellationToken::new())
            .await
    }

    async fn backoff(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.retry_backoff) => {}
        }
    }

    /// Handle `updates` in delivery order. Stops at the first update that could not
    /// be acknowledged so nothing after it is handled out of order.
    async fn process_batch(
        &self,
        mut offset: i64,
        updates: Vec<InboundUpdate>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut acked = 0;
        for update in updates {
            if cancel.is_cancelled() {
                break;
            }
            if update.id.0 <= offset {
                tracing::debug!(update = update.id.0, offset, "skipping already acknowledged update");
                continue;
            }
            self.handle_update(&update).await?;
            offset = update.id.0;
            acked += 1;
        }
        Ok(acked)
    }

    /// Route, reply, and acknowledge a single update.
    ///
    /// `Err` means the update was NOT acknowledged and will be redelivered.
    pub async fn handle_update(&self, update: &InboundUpdate) -> Result<()> {
        let Some(msg) = &update.message else {
            tracing::debug!(update = update.id.0, "no text message; acknowledging without reply");
            self.offsets.advance(update.id.0).await?;
            return Ok(());
        };

        let (route, outcome) = self.route(msg).await;
        let (reply, failure) = match &outcome {
            Ok(text) => (text.clone(), None),
            Err(e) => {
                let failure = Failure::from(e);
                if e.is_retryable() {
                    tracing::error!(
                        update = update.id.0,
                        route = route.as_str(),
                        kind = ?failure.kind,
                        error = %failure.internal,
                        "update failed"
                    );
                } else {
                    tracing::info!(
                        update = update.id.0,
                        route = route.as_str(),
                        kind = ?failure.kind,
                        detail = %failure.internal,
                        "update rejected"
                    );
                }
                (failure.message.clone(), Some(failure))
            }
        };

        self.reply(msg, &reply).await;
        self.write_audit(update.id, msg, route, &reply, failure);

        // Hard failures keep their kind and leave the update for redelivery.
        if let Err(e) = outcome {
            if e.is_retryable() {
                return Err(e);
            }
        }

        self.offsets.advance(update.id.0).await?;
        Ok(())
    }

    async fn route(&self, msg: &InboundMessage) -> (Route, Result<String>) {
        let text = msg.text.trim();
        let identity = msg.chat_id.0.to_string();

        if let Some(code) = start_code(text) {
            return (Route::Link, self.link(code, &identity, &msg.sender_name).await);
        }

        let account = match self.linking.resolve(&self.settings.provider, &identity).await {
            Ok(account) => account,
            Err(e) => return (Route::Unregistered, Err(e)),
        };

        if let Some(command) = text.strip_prefix('!') {
            let out = self
                .dispatcher
                .dispatch(command, msg.timestamp, account.id)
                .await
                .map(|o| o.text);
            return (Route::Command, out);
        }

        let out = self
            .recorder
            .record(&msg.text, msg.timestamp, account.id)
            .await
            .map(|r| render_recorded(&r));
        (Route::Expense, out)
    }

    async fn link(&self, code: Option<&str>, identity: &str, sender: &str) -> Result<String> {
        let Some(code) = code else {
            return Ok(WELCOME_TEXT.to_string());
        };

        match self.linking.resolve(&self.settings.provider, identity).await {
            Ok(_) => {
                return Err(Error::AlreadyLinked {
                    provider: self.settings.provider.clone(),
                    provider_user_id: identity.to_string(),
                })
            }
            Err(Error::Unregistered { .. }) => {}
            Err(e) => return Err(e),
        }

        let display_name = Some(sender.to_string()).filter(|s| !s.trim().is_empty());
        let (account, _) = self
            .linking
            .redeem(code, &self.settings.provider, identity, display_name)
            .await?;
        Ok(format!(
            "Your Telegram account has been linked to {}! You can now track expenses here.",
            account.display_name()
        ))
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) {
        let text = self.messenger.capabilities().fit(text);
        if let Err(e) = self.messenger.send_text(msg.chat_id, &text).await {
            tracing::warn!(chat = msg.chat_id.0, error = %e, "failed to send reply");
        }
    }

    fn write_audit(
        &self,
        update_id: UpdateId,
        msg: &InboundMessage,
        route: Route,
        reply: &str,
        failure: Option<Failure>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let ev = AuditEvent::handled(
            update_id,
            msg.chat_id,
            &msg.sender_name,
            route.as_str(),
            &msg.text,
            reply,
            failure,
        );
        if let Err(e) = audit.write(ev) {
            tracing::warn!(path = %audit.path().display(), error = %e, "audit write failed");
        }
    }
}

/// `Some(code)` for a `/start` message (`Some(None)` when it has no code).
///
/// Telegram may send `/start@botname CODE`.
fn start_code(text: &str) -> Option<Option<&str>> {
    let rest = text.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").split('@').next().unwrap_or("");
    if !cmd.eq_ignore_ascii_case("start") {
        return None;
    }
    Some(parts.next().map(str::trim).filter(|c| !c.is_empty()))
}

fn render_recorded(r: &Recorded) -> String {
    let t = &r.transaction;
    let mut line = format!(
        "{} {} in {}",
        format_cents(t.amount_cents),
        t.currency,
        t.category
    );
    if !t.notes.is_empty() {
        line.push_str(&format!(" ({})", t.notes));
    }
    if r.created {
        format!("Recorded {line}.")
    } else {
        format!("Already recorded: {line}.")
    }
}
