use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::{
    config::is_currency_code,
    domain::{AccountId, Cents, Transaction, TransactionId},
    errors::Error,
    fingerprint::{fingerprint, DedupBucket, FingerprintInput},
    ports::{AccountStore, TransactionStore},
    Result,
};

/// Longest message accepted as an expense, in characters.
pub const MAX_MESSAGE_CHARS: usize = 160;

pub const DEFAULT_CATEGORY: &str = "uncategorized";

/// Largest accepted amount: one billion in the major unit.
pub const MAX_AMOUNT_CENTS: Cents = 100_000_000_000;

const LENGTH_MESSAGE: &str = "Message cannot be empty or exceed 160 characters.";
const FORMAT_MESSAGE: &str =
    "Start your message with an amount, e.g. \"45.50 coffee\" or \"12 USD lunch with Sam\".";
const RANGE_MESSAGE: &str = "Amount must be between 0 and 1,000,000,000.";

/// Expense fields extracted from a chat message.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpenseDraft {
    pub amount_cents: Cents,
    /// Explicit currency, if the message named one.
    pub currency: Option<String>,
    pub category: String,
    pub notes: String,
}

/// Result of `record`: the stored row and whether this call created it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recorded {
    pub transaction: Transaction,
    pub created: bool,
}

/// Parse `<amount> [CUR] [category] [notes...]`.
pub fn parse_expense(raw_text: &str) -> Result<ExpenseDraft> {
    let text = raw_text.trim();
    let chars = raw_text.chars().count();
    if text.is_empty() || chars > MAX_MESSAGE_CHARS {
        return Err(Error::validation(
            format!("message length {chars} outside 1..={MAX_MESSAGE_CHARS}"),
            LENGTH_MESSAGE,
        ));
    }

    let mut tokens = text.split_whitespace().peekable();
    let amount_token = tokens.next().unwrap_or_default();
    let amount_cents = parse_amount(amount_token)?;

    let currency = match tokens.peek() {
        Some(tok) if is_currency_code(tok) => tokens.next().map(str::to_string),
        _ => None,
    };

    let category = tokens
        .next()
        .map(|c| c.to_lowercase())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let notes = tokens.collect::<Vec<_>>().join(" ");

    Ok(ExpenseDraft {
        amount_cents,
        currency,
        category,
        notes,
    })
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?(\d+(\.\d*)?|\.\d+)$").expect("valid regex"))
}

/// Non-negative decimal amount -> cents, rounded half away from zero.
///
/// Zero is accepted. Anything above `MAX_AMOUNT_CENTS` is rejected so stored
/// totals stay far from `i64` overflow.
fn parse_amount(token: &str) -> Result<Cents> {
    let invalid = |why: &str, user: &str| {
        Error::validation(format!("amount token '{token}' rejected: {why}"), user)
    };

    // `f64::from_str` also takes "inf", "NaN" and exponents; only plain decimals here.
    if !amount_re().is_match(token) {
        return Err(invalid("not a non-negative decimal number", FORMAT_MESSAGE));
    }
    let value: f64 = token
        .parse()
        .map_err(|_| invalid("unparseable", FORMAT_MESSAGE))?;
    let cents = (value * 100.0).round();
    if !cents.is_finite() || cents > MAX_AMOUNT_CENTS as f64 {
        return Err(invalid("above the amount ceiling", RANGE_MESSAGE));
    }
    Ok(cents as Cents)
}

/// Validates expense messages and stores them exactly once.
#[derive(Clone)]
pub struct TransactionRecorder {
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionStore>,
    bucket: DedupBucket,
}

impl TransactionRecorder {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionStore>,
        bucket: DedupBucket,
    ) -> Self {
        Self {
            accounts,
            transactions,
            bucket,
        }
    }

    /// Record the expense in `raw_text` for `account_id`.
    ///
    /// Re-running with identical input inside the same dedup bucket returns the
    /// existing row with `created = false`.
    pub async fn record(
        &self,
        raw_text: &str,
        timestamp: DateTime<Utc>,
        account_id: AccountId,
    ) -> Result<Recorded> {
        let draft = parse_expense(raw_text)?;

        let currency = match draft.currency {
            Some(c) => c,
            None => {
                self.accounts
                    .account_by_id(account_id)
                    .await?
                    .ok_or_else(|| Error::Storage(format!("account {account_id} not found")))?
                    .preferred_currency
            }
        };

        let hash = fingerprint(
            &FingerprintInput {
                account_id,
                amount_cents: draft.amount_cents,
                currency: &currency,
                category: &draft.category,
                notes: &draft.notes,
                timestamp,
            },
            self.bucket,
        );

        if let Some(existing) = self
            .transactions
            .transaction_by_hash(account_id, &hash)
            .await?
        {
            tracing::info!(account = %account_id, tx = %existing.id, "duplicate transaction suppressed");
            return Ok(Recorded {
                transaction: existing,
                created: false,
            });
        }

        let tx = Transaction {
            id: TransactionId(Uuid::new_v4()),
            account_id,
            amount_cents: draft.amount_cents,
            currency,
            category: draft.category,
            notes: draft.notes,
            timestamp,
            hash,
        };

        match self.transactions.insert_transaction(&tx).await {
            Ok(()) => {
                tracing::info!(account = %account_id, tx = %tx.id, amount = tx.amount_cents, "transaction recorded");
                Ok(Recorded {
                    transaction: tx,
                    created: true,
                })
            }
            Err(Error::Conflict(detail)) => {
                tracing::info!(account = %account_id, %detail, "lost insert race; returning existing row");
                let existing = self
                    .transactions
                    .transaction_by_hash(account_id, &tx.hash)
                    .await?
                    .ok_or_else(|| {
                        Error::Storage(format!(
                            "conflict on hash {} but no row to re-fetch",
                            tx.hash
                        ))
                    })?;
                Ok(Recorded {
                    transaction: existing,
                    created: false,
                })
            }
            Err(e) => {
                tracing::error!(account = %account_id, error = %e, "transaction insert failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        domain::Account,
        errors::ErrorKind,
        store::memory::{FailPoint, InMemoryStore},
    };

    async fn setup() -> (Arc<InMemoryStore>, TransactionRecorder, AccountId) {
        let store = Arc::new(InMemoryStore::new());
        let account = Account::new("aroha", "NZD");
        store.insert_account(&account).await.unwrap();
        let recorder = TransactionRecorder::new(store.clone(), store.clone(), DedupBucket::Day);
        (store, recorder, account.id)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_amount_category_and_notes() {
        let d = parse_expense("45.50 Coffee flat white").unwrap();
        assert_eq!(d.amount_cents, 4550);
        assert_eq!(d.currency, None);
        assert_eq!(d.category, "coffee");
        assert_eq!(d.notes, "flat white");

        let d = parse_expense("12 USD lunch").unwrap();
        assert_eq!(d.currency.as_deref(), Some("USD"));
        assert_eq!(d.category, "lunch");

        let d = parse_expense("  7 ").unwrap();
        assert_eq!(d.amount_cents, 700);
        assert_eq!(d.category, DEFAULT_CATEGORY);
        assert_eq!(d.notes, "");

        // Lowercase three-letter words are categories, not currencies.
        let d = parse_expense("3.2 tea").unwrap();
        assert_eq!(d.amount_cents, 320);
        assert_eq!(d.currency, None);
        assert_eq!(d.category, "tea");
    }

    #[test]
    fn rejects_non_numeric_or_non_finite_amounts() {
        for bad in [
            "coffee 4",
            "inf",
            "NaN x",
            "1e5 rent",
            "$4",
            "4,50 tea",
            ".",
            "-25 refund",
            "-0.5",
            "+-3",
        ] {
            let err = parse_expense(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
            assert_eq!(err.user_message(), FORMAT_MESSAGE);
        }
    }

    #[test]
    fn zero_and_explicit_plus_are_accepted() {
        assert_eq!(parse_expense("0 nothing").unwrap().amount_cents, 0);
        assert_eq!(parse_expense("0.001 dust").unwrap().amount_cents, 0);
        assert_eq!(parse_expense("+12.5 lunch").unwrap().amount_cents, 1250);
    }

    #[test]
    fn amounts_above_the_ceiling_are_rejected() {
        assert_eq!(
            parse_expense("1000000000 yacht").unwrap().amount_cents,
            MAX_AMOUNT_CENTS
        );
        for big in ["1000000000.01 yacht", "40000000000000000 big", "99999999999999999999999"] {
            let err = parse_expense(big).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{big}");
            assert_eq!(err.user_message(), RANGE_MESSAGE);
        }
    }

    #[test]
    fn length_limit_counts_characters() {
        let ok = format!("1 {}", "é".repeat(MAX_MESSAGE_CHARS - 2));
        assert!(parse_expense(&ok).is_ok());
        let too_long = format!("1 {}", "x".repeat(MAX_MESSAGE_CHARS - 1));
        assert!(parse_expense(&too_long).is_err());
    }

    #[tokio::test]
    async fn records_with_default_currency() {
        let (store, recorder, account) = setup().await;
        let r = recorder.record("45.50 coffee", noon(), account).await.unwrap();
        assert!(r.created);
        assert_eq!(r.transaction.amount_cents, 4550);
        assert_eq!(r.transaction.currency, "NZD");
        assert_eq!(r.transaction.category, "coffee");
        assert_eq!(r.transaction.hash.len(), 64);
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn identical_submission_in_same_bucket_is_stored_once() {
        let (store, recorder, account) = setup().await;
        let first = recorder.record("45.50 coffee", noon(), account).await.unwrap();
        let later = noon() + chrono::TimeDelta::hours(3);
        let second = recorder.record("45.50 coffee", later, account).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn next_day_is_a_new_transaction() {
        let (store, recorder, account) = setup().await;
        recorder.record("45.50 coffee", noon(), account).await.unwrap();
        let tomorrow = noon() + chrono::TimeDelta::days(1);
        let r = recorder.record("45.50 coffee", tomorrow, account).await.unwrap();
        assert!(r.created);
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn invalid_messages_store_nothing() {
        let (store, recorder, account) = setup().await;
        for bad in ["".to_string(), "   ".to_string(), "x".repeat(161)] {
            let err = recorder.record(&bad, noon(), account).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
        }
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn insert_race_recovers_with_existing_row() {
        let (store, recorder, account) = setup().await;
        store.race_next_insert();

        let r = recorder.record("9 bus", noon(), account).await.unwrap();
        assert!(!r.created);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.all_transactions()[0].id, r.transaction.id);
    }

    #[tokio::test]
    async fn storage_failure_is_surfaced_generically() {
        let (store, recorder, account) = setup().await;
        store.fail_next(FailPoint::TransactionInsert);

        let err = recorder.record("9 bus", noon(), account).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.user_message().contains("injected"));
        assert_eq!(store.transaction_count(), 0);

        // Redelivery succeeds once the store recovers.
        assert!(recorder.record("9 bus", noon(), account).await.unwrap().created);
    }
}
