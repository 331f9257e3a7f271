use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::{
    domain::{Account, AccountId, LinkedIdentity},
    errors::Error,
    ports::AccountStore,
    Result,
};

/// Provider name for identities that arrive through the Telegram transport.
pub const TELEGRAM_PROVIDER: &str = "telegram";

const LINK_CODE_LEN: usize = 8;

/// Freshly issued link code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkCode {
    pub code: String,
    pub expires: DateTime<Utc>,
}

/// Maps external identities to accounts via single-use link codes.
///
/// Per identity: unlinked (no row) -> linked (row exists, immutable). The account's
/// pending code is independent of how many identities it already has.
#[derive(Clone)]
pub struct LinkingService {
    accounts: Arc<dyn AccountStore>,
}

impl LinkingService {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    pub async fn resolve_link_code(&self, code: &str) -> Result<Account> {
        self.resolve_link_code_at(code, Utc::now()).await
    }

    /// Account holding `code`, provided the code has not expired at `now`.
    pub async fn resolve_link_code_at(&self, code: &str, now: DateTime<Utc>) -> Result<Account> {
        let code = code.trim();
        let Some(account) = self.accounts.account_by_link_code(code).await? else {
            return Err(Error::NotFound(format!("no account holds link code {code}")));
        };
        match account.link_code_expires {
            Some(expires) if now < expires => Ok(account),
            Some(expires) => Err(Error::Expired(format!(
                "link code {code} for account {} expired at {expires}",
                account.id
            ))),
            None => Err(Error::Expired(format!(
                "link code {code} for account {} has no expiry",
                account.id
            ))),
        }
    }

    /// Bind `(provider, provider_user_id)` to `account_id` and clear the account's code.
    pub async fn link_identity(
        &self,
        account_id: AccountId,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<LinkedIdentity> {
        let identity = LinkedIdentity::new(account_id, provider, provider_user_id, None);
        self.link(identity, None).await
    }

    /// Resolve `code` and link the identity to its account in one step.
    ///
    /// The code is consumed with a compare-and-clear, so when two identities race on
    /// the same code exactly one of them wins and the other gets `NotFound`.
    pub async fn redeem(
        &self,
        code: &str,
        provider: &str,
        provider_user_id: &str,
        display_name: Option<String>,
    ) -> Result<(Account, LinkedIdentity)> {
        self.redeem_at(code, provider, provider_user_id, display_name, Utc::now())
            .await
    }

    pub async fn redeem_at(
        &self,
        code: &str,
        provider: &str,
        provider_user_id: &str,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Account, LinkedIdentity)> {
        let code = code.trim();
        let account = self.resolve_link_code_at(code, now).await?;
        let identity = LinkedIdentity::new(account.id, provider, provider_user_id, display_name);
        let identity = self.link(identity, Some(code)).await?;
        Ok((account, identity))
    }

    async fn link(
        &self,
        identity: LinkedIdentity,
        expected_code: Option<&str>,
    ) -> Result<LinkedIdentity> {
        if self
            .accounts
            .identity(&identity.provider, &identity.provider_user_id)
            .await?
            .is_some()
        {
            return Err(already_linked(&identity));
        }

        match self.accounts.link_identity(&identity, expected_code).await {
            Ok(()) => {
                tracing::info!(
                    account = %identity.account_id,
                    provider = %identity.provider,
                    provider_user_id = %identity.provider_user_id,
                    "identity linked"
                );
                Ok(identity)
            }
            // Lost a race against another link of the same identity.
            Err(Error::Conflict(_)) => Err(already_linked(&identity)),
            Err(e) => Err(e),
        }
    }

    /// Account linked to `(provider, provider_user_id)`.
    pub async fn resolve(&self, provider: &str, provider_user_id: &str) -> Result<Account> {
        let Some(identity) = self.accounts.identity(provider, provider_user_id).await? else {
            return Err(Error::Unregistered {
                provider: provider.to_string(),
                provider_user_id: provider_user_id.to_string(),
            });
        };
        self.accounts
            .account_by_id(identity.account_id)
            .await?
            .ok_or_else(|| {
                Error::Storage(format!(
                    "identity {provider}:{provider_user_id} points at missing account {}",
                    identity.account_id
                ))
            })
    }

    /// Issue a fresh code for `account_id`, replacing any previous one.
    pub async fn issue_link_code(&self, account_id: AccountId, ttl: Duration) -> Result<LinkCode> {
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|e| Error::Config(format!("link code ttl out of range: {e}")))?;
        let expires = Utc::now() + ttl;

        // Retry on the (unlikely) collision with another account's live code.
        const ATTEMPTS: usize = 3;
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            let code = generate_code();
            match self.accounts.set_link_code(account_id, &code, expires).await {
                Ok(()) => {
                    tracing::info!(account = %account_id, %expires, "link code issued");
                    return Ok(LinkCode { code, expires });
                }
                Err(Error::Conflict(e)) => last_err = Some(Error::Conflict(e)),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Conflict("link code collision".to_string())))
    }
}

fn already_linked(identity: &LinkedIdentity) -> Error {
    Error::AlreadyLinked {
        provider: identity.provider.clone(),
        provider_user_id: identity.provider_user_id.clone(),
    }
}

fn generate_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(LINK_CODE_LEN)
        .collect::<String>()
        .to_uppercase()
}
