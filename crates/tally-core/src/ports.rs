use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{domain::*, Result};

/// Accounts and the identities linked to them.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn insert_account(&self, account: &Account) -> Result<()>;

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>>;

    /// Account currently holding `code`, expired or not.
    async fn account_by_link_code(&self, code: &str) -> Result<Option<Account>>;

    async fn identity(&self, provider: &str, provider_user_id: &str)
        -> Result<Option<LinkedIdentity>>;

    async fn identities_for_account(&self, account_id: AccountId) -> Result<Vec<LinkedIdentity>>;

    /// Replace the account's link code and expiry.
    async fn set_link_code(
        &self,
        account_id: AccountId,
        code: &str,
        expires: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert `identity` and clear its account's link code + expiry as one atomic unit.
    ///
    /// With `expected_code = Some(c)` the clear only applies while the account still
    /// holds `c`; otherwise nothing is written and `NotFound` is returned.
    /// A duplicate `(provider, provider_user_id)` fails with `Conflict`.
    async fn link_identity(
        &self,
        identity: &LinkedIdentity,
        expected_code: Option<&str>,
    ) -> Result<()>;
}

/// Filter for listing transactions. `since..=until` on the transaction timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionQuery {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub category: Option<String>,
    pub currency: Option<String>,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub currency: String,
    pub total_cents: Cents,
    pub count: i64,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn transaction_by_hash(
        &self,
        account_id: AccountId,
        hash: &str,
    ) -> Result<Option<Transaction>>;

    /// Insert a new row. A duplicate `(account_id, hash)` fails with `Conflict`.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Newest first (timestamp, then id), at most `query.limit` rows.
    async fn list_transactions(
        &self,
        account_id: AccountId,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>>;

    /// Totals grouped by category and currency, largest total first.
    async fn category_totals(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        currency: Option<&str>,
    ) -> Result<Vec<CategoryTotal>>;
}

/// Single persisted checkpoint of the last fully handled update id.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load_offset(&self) -> Result<Option<i64>>;

    /// Persist `value` unless the stored value is already greater or equal.
    async fn store_offset(&self, value: i64) -> Result<()>;
}

/// Everything the bot persists.
pub trait LedgerStore: AccountStore + TransactionStore + OffsetStore {}

impl<T: AccountStore + TransactionStore + OffsetStore> LedgerStore for T {}
