use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use uuid::Uuid;

use tally_core::{
    domain::{Account, AccountId, LinkedIdentity, Transaction, TransactionId},
    ports::{AccountStore, CategoryTotal, OffsetStore, TransactionQuery, TransactionStore},
    Error, Result,
};

use super::MIGRATION_001_INITIAL;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT_COLUMNS: &str =
    "id, first_name, last_name, username, preferred_currency, link_code, link_code_expires, created_at";
const IDENTITY_COLUMNS: &str =
    "id, account_id, provider, provider_user_id, display_name, created_at";
const TRANSACTION_COLUMNS: &str =
    "id, account_id, amount_cents, currency, category, notes, timestamp, hash";

/// `LedgerStore` backed by a SQLite connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` (e.g. `sqlite:tally.db?mode=rwc`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::Config(format!("invalid DATABASE_URL '{database_url}': {e}")))?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_error("failed to connect to database"))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations. Safe to repeat.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to run migration 001"))?;
        Ok(())
    }

    /// Connect + migrate.
    pub async fn init(database_url: &str) -> Result<Self> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        tracing::debug!(database_url, "sqlite store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_account(row: &SqliteRow) -> Result<Account> {
        Ok(Account {
            id: AccountId(parse_uuid(row.get("id"), "account id")?),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            username: row.get("username"),
            preferred_currency: row.get("preferred_currency"),
            link_code: row.get("link_code"),
            link_code_expires: row
                .get::<Option<String>, _>("link_code_expires")
                .map(|s| parse_ts(&s, "link_code_expires"))
                .transpose()?,
            created_at: parse_ts(&row.get::<String, _>("created_at"), "created_at")?,
        })
    }

    fn row_to_identity(row: &SqliteRow) -> Result<LinkedIdentity> {
        Ok(LinkedIdentity {
            id: parse_uuid(row.get("id"), "identity id")?,
            account_id: AccountId(parse_uuid(row.get("account_id"), "account id")?),
            provider: row.get("provider"),
            provider_user_id: row.get("provider_user_id"),
            display_name: row.get("display_name"),
            created_at: parse_ts(&row.get::<String, _>("created_at"), "created_at")?,
        })
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
        Ok(Transaction {
            id: TransactionId(parse_uuid(row.get("id"), "transaction id")?),
            account_id: AccountId(parse_uuid(row.get("account_id"), "account id")?),
            amount_cents: row.get("amount_cents"),
            currency: row.get("currency"),
            category: row.get("category"),
            notes: row.get("notes"),
            timestamp: parse_ts(&row.get::<String, _>("timestamp"), "timestamp")?,
            hash: row.get("hash"),
        })
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, first_name, last_name, username, preferred_currency, link_code, link_code_expires, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.id.to_string())
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.username)
        .bind(&account.preferred_currency)
        .bind(&account.link_code)
        .bind(account.link_code_expires.map(ts))
        .bind(ts(account.created_at))
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to save account"))?;
        Ok(())
    }

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to fetch account"))?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn account_by_link_code(&self, code: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE link_code = ?"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to fetch account by link code"))?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>> {
        let row = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM linked_identities WHERE provider = ? AND provider_user_id = ?"
        ))
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to fetch identity"))?;
        row.as_ref().map(Self::row_to_identity).transpose()
    }

    async fn identities_for_account(&self, account_id: AccountId) -> Result<Vec<LinkedIdentity>> {
        let rows = sqlx::query(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM linked_identities WHERE account_id = ? ORDER BY created_at, id"
        ))
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list identities"))?;
        rows.iter().map(Self::row_to_identity).collect()
    }

    async fn set_link_code(
        &self,
        account_id: AccountId,
        code: &str,
        expires: DateTime<Utc>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE accounts SET link_code = ?, link_code_expires = ? WHERE id = ?")
                .bind(code)
                .bind(ts(expires))
                .bind(account_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_error("failed to set link code"))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    async fn link_identity(
        &self,
        identity: &LinkedIdentity,
        expected_code: Option<&str>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin link transaction"))?;

        sqlx::query(&format!(
            "INSERT INTO linked_identities ({IDENTITY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(identity.id.to_string())
        .bind(identity.account_id.to_string())
        .bind(&identity.provider)
        .bind(&identity.provider_user_id)
        .bind(&identity.display_name)
        .bind(ts(identity.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_error("failed to insert identity"))?;

        let cleared = match expected_code {
            Some(code) => sqlx::query(
                "UPDATE accounts SET link_code = NULL, link_code_expires = NULL WHERE id = ? AND link_code = ?",
            )
            .bind(identity.account_id.to_string())
            .bind(code),
            None => sqlx::query(
                "UPDATE accounts SET link_code = NULL, link_code_expires = NULL WHERE id = ?",
            )
            .bind(identity.account_id.to_string()),
        }
        .execute(&mut *tx)
        .await
        .map_err(db_error("failed to clear link code"))?
        .rows_affected();

        if cleared == 0 {
            // Dropping `tx` rolls the identity insert back.
            return Err(Error::NotFound(match expected_code {
                Some(code) => format!("link code {code} already consumed"),
                None => format!("account {}", identity.account_id),
            }));
        }

        tx.commit()
            .await
            .map_err(db_error("failed to commit link transaction"))?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn transaction_by_hash(
        &self,
        account_id: AccountId,
        hash: &str,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ? AND hash = ?"
        ))
        .bind(account_id.to_string())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to fetch transaction by hash"))?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn insert_transaction(&self, t: &Transaction) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(t.id.to_string())
        .bind(t.account_id.to_string())
        .bind(t.amount_cents)
        .bind(&t.currency)
        .bind(&t.category)
        .bind(&t.notes)
        .bind(ts(t.timestamp))
        .bind(&t.hash)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to save transaction"))?;
        Ok(())
    }

    async fn list_transactions(
        &self,
        account_id: AccountId,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>> {
        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ? AND timestamp >= ? AND timestamp <= ?"
        );
        if query.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if query.currency.is_some() {
            sql.push_str(" AND currency = ?");
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");

        let mut q = sqlx::query(&sql)
            .bind(account_id.to_string())
            .bind(ts(query.since))
            .bind(ts(query.until));
        if let Some(category) = &query.category {
            q = q.bind(category);
        }
        if let Some(currency) = &query.currency {
            q = q.bind(currency);
        }
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = q
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("failed to list transactions"))?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    async fn category_totals(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        currency: Option<&str>,
    ) -> Result<Vec<CategoryTotal>> {
        let mut sql = String::from(
            r#"
            SELECT category, currency, SUM(amount_cents) AS total_cents, COUNT(*) AS count
            FROM transactions
            WHERE account_id = ? AND timestamp >= ? AND timestamp <= ?
            "#,
        );
        if currency.is_some() {
            sql.push_str(" AND currency = ?");
        }
        sql.push_str(" GROUP BY category, currency ORDER BY total_cents DESC, category ASC");

        let mut q = sqlx::query(&sql)
            .bind(account_id.to_string())
            .bind(ts(since))
            .bind(ts(until));
        if let Some(currency) = currency {
            q = q.bind(currency);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("failed to compute category totals"))?;
        Ok(rows
            .iter()
            .map(|row| CategoryTotal {
                category: row.get("category"),
                currency: row.get("currency"),
                total_cents: row.get("total_cents"),
                count: row.get("count"),
            })
            .collect())
    }
}

#[async_trait]
impl OffsetStore for SqliteStore {
    async fn load_offset(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT value FROM update_offset WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("failed to load offset"))?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn store_offset(&self, value: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO update_offset (id, value) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
        )
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to store offset"))?;
        Ok(())
    }
}

/// Map a sqlx error into the core taxonomy. Unique violations become `Conflict`.
fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{context}: {db}"))
        }
        _ => Error::Storage(format!("{context}: {e}")),
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, what: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("invalid {what} timestamp '{s}': {e}")))
}

fn parse_uuid(s: String, what: &str) -> Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| Error::Storage(format!("invalid {what} '{s}': {e}")))
}
