use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Chat id on the transport (numeric on Telegram).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChatId(pub i64);

/// Monotonic id of an inbound update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UpdateId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TransactionId(pub Uuid);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Money as integer cents. 45.50 is stored as 4550.
pub type Cents = i64;

pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

pub const DEFAULT_CURRENCY: &str = "NZD";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub preferred_currency: String,
    #[serde(skip_serializing)]
    pub link_code: Option<String>,
    pub link_code_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(username: impl Into<String>, preferred_currency: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(),
            first_name: String::new(),
            last_name: String::new(),
            username: username.into(),
            preferred_currency: preferred_currency.into(),
            link_code: None,
            link_code_expires: None,
            created_at: Utc::now(),
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_string()
        }
    }
}

/// External identity (provider + provider-specific id) bound to one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkedIdentity {
    pub id: Uuid,
    pub account_id: AccountId,
    pub provider: String,
    pub provider_user_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LinkedIdentity {
    pub fn new(
        account_id: AccountId,
        provider: impl Into<String>,
        provider_user_id: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            provider: provider.into(),
            provider_user_id: provider_user_id.into(),
            display_name,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub amount_cents: Cents,
    pub currency: String,
    pub category: String,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
    pub hash: String,
}

/// Inbound update as delivered by the transport.
///
/// `message` is `None` for update kinds the bot does not handle (edits, callbacks, ...);
/// those are acknowledged without a reply.
#[derive(Clone, Debug)]
pub struct InboundUpdate {
    pub id: UpdateId,
    pub message: Option<InboundMessage>,
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_cents_pads_and_signs() {
        assert_eq!(format_cents(4550), "45.50");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-1234), "-12.34");
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let mut a = Account::new("kiwi", "NZD");
        assert_eq!(a.display_name(), "kiwi");
        a.first_name = "Aroha".into();
        assert_eq!(a.display_name(), "Aroha");
    }
}
