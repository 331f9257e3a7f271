use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    domain::*,
    errors::Error,
    ports::{AccountStore, CategoryTotal, OffsetStore, TransactionQuery, TransactionStore},
    Result,
};

/// Operations that can be made to fail once, for exercising error paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    OffsetWrite,
    TransactionInsert,
    LinkIdentity,
}

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    identities: Vec<LinkedIdentity>,
    transactions: Vec<Transaction>,
    offset: Option<i64>,
    fail_once: HashSet<FailPoint>,
    race_next_insert: bool,
}

/// `LedgerStore` kept entirely in memory.
///
/// Each method holds one lock for its whole body, so multi-row writes are atomic
/// to concurrent callers the same way a database transaction would be.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call through `point` fail with `Storage`.
    pub fn fail_next(&self, point: FailPoint) {
        self.lock().fail_once.insert(point);
    }

    pub fn fail_next_offset_write(&self) {
        self.fail_next(FailPoint::OffsetWrite);
    }

    /// Make the next `insert_transaction` lose a race: an identical row from
    /// "another writer" lands first and the call fails with `Conflict`.
    pub fn race_next_insert(&self) {
        self.lock().race_next_insert = true;
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    pub fn identity_count(&self) -> usize {
        self.lock().identities.len()
    }

    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }
}

impl State {
    fn check(&mut self, point: FailPoint) -> Result<()> {
        if self.fail_once.remove(&point) {
            return Err(Error::Storage(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut st = self.lock();
        if st.accounts.contains_key(&account.id) {
            return Err(Error::Conflict(format!("account {} exists", account.id)));
        }
        if st.accounts.values().any(|a| a.username == account.username) {
            return Err(Error::Conflict(format!(
                "username '{}' is taken",
                account.username
            )));
        }
        st.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn account_by_link_code(&self, code: &str) -> Result<Option<Account>> {
        Ok(self
            .lock()
            .accounts
            .values()
            .find(|a| a.link_code.as_deref() == Some(code))
            .cloned())
    }

    async fn identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>> {
        let st = self.lock();
        Ok(st
            .identities
            .iter()
            .find(|i| i.provider == provider && i.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn identities_for_account(&self, account_id: AccountId) -> Result<Vec<LinkedIdentity>> {
        Ok(self
            .lock()
            .identities
            .iter()
            .filter(|i| i.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn set_link_code(
        &self,
        account_id: AccountId,
        code: &str,
        expires: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.lock();
        if st
            .accounts
            .values()
            .any(|a| a.id != account_id && a.link_code.as_deref() == Some(code))
        {
            return Err(Error::Conflict(format!("link code {code} is in use")));
        }
        let account = st
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| Error::NotFound(format!("account {account_id}")))?;
        account.link_code = Some(code.to_string());
        account.link_code_expires = Some(expires);
        Ok(())
    }

    async fn link_identity(
        &self,
        identity: &LinkedIdentity,
        expected_code: Option<&str>,
    ) -> Result<()> {
        let mut st = self.lock();
        st.check(FailPoint::LinkIdentity)?;

        if st.identities.iter().any(|i| {
            i.provider == identity.provider && i.provider_user_id == identity.provider_user_id
        }) {
            return Err(Error::Conflict(format!(
                "identity {}:{} exists",
                identity.provider, identity.provider_user_id
            )));
        }

        let account = st
            .accounts
            .get_mut(&identity.account_id)
            .ok_or_else(|| Error::NotFound(format!("account {}", identity.account_id)))?;
        if let Some(code) = expected_code {
            if account.link_code.as_deref() != Some(code) {
                return Err(Error::NotFound(format!("link code {code} already consumed")));
            }
        }
        account.link_code = None;
        account.link_code_expires = None;
        st.identities.push(identity.clone());
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn transaction_by_hash(
        &self,
        account_id: AccountId,
        hash: &str,
    ) -> Result<Option<Transaction>> {
        let st = self.lock();
        Ok(st
            .transactions
            .iter()
            .find(|t| t.account_id == account_id && t.hash == hash)
            .cloned())
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut st = self.lock();
        st.check(FailPoint::TransactionInsert)?;

        if std::mem::take(&mut st.race_next_insert) {
            let mut winner = tx.clone();
            winner.id = TransactionId(Uuid::new_v4());
            st.transactions.push(winner);
        }

        if st
            .transactions
            .iter()
            .any(|t| t.account_id == tx.account_id && t.hash == tx.hash)
        {
            return Err(Error::Conflict(format!("transaction hash {}", tx.hash)));
        }
        st.transactions.push(tx.clone());
        Ok(())
    }

    async fn list_transactions(
        &self,
        account_id: AccountId,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>> {
        let st = self.lock();
        let mut rows: Vec<Transaction> = st
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .filter(|t| t.timestamp >= query.since && t.timestamp <= query.until)
            .filter(|t| query.category.as_deref().map_or(true, |c| t.category == c))
            .filter(|t| query.currency.as_deref().map_or(true, |c| t.currency == c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn category_totals(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        currency: Option<&str>,
    ) -> Result<Vec<CategoryTotal>> {
        let st = self.lock();
        let mut totals: HashMap<(String, String), (Cents, i64)> = HashMap::new();
        for t in st.transactions.iter().filter(|t| {
            t.account_id == account_id
                && t.timestamp >= since
                && t.timestamp <= until
                && currency.map_or(true, |c| t.currency == c)
        }) {
            let e = totals
                .entry((t.category.clone(), t.currency.clone()))
                .or_insert((0, 0));
            // SQLite's SUM fails the same way.
            e.0 = e.0.checked_add(t.amount_cents).ok_or_else(|| {
                Error::Storage(format!("integer overflow summing '{}'", t.category))
            })?;
            e.1 += 1;
        }
        let mut out: Vec<CategoryTotal> = totals
            .into_iter()
            .map(|((category, currency), (total_cents, count))| CategoryTotal {
                category,
                currency,
                total_cents,
                count,
            })
            .collect();
        out.sort_by(|a, b| {
            b.total_cents
                .cmp(&a.total_cents)
                .then_with(|| a.category.cmp(&b.category))
        });
        Ok(out)
    }
}

#[async_trait]
impl OffsetStore for InMemoryStore {
    async fn load_offset(&self) -> Result<Option<i64>> {
        Ok(self.lock().offset)
    }

    async fn store_offset(&self, value: i64) -> Result<()> {
        let mut st = self.lock();
        st.check(FailPoint::OffsetWrite)?;
        st.offset = Some(st.offset.map_or(value, |cur| cur.max(value)));
        Ok(())
    }
}
