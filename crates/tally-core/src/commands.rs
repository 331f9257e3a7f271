//! `!`-prefixed reporting commands.
//!
//! Grammar: `<name> [positional] [key=value ...]`. Windows are anchored at the
//! timestamp of the message that carried the command, so re-running a redelivered
//! command yields the same answer.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Utc};

use crate::{
    config::is_currency_code,
    domain::{format_cents, AccountId, Cents, Transaction},
    errors::Error,
    ports::{CategoryTotal, TransactionQuery, TransactionStore},
    Result,
};

/// Lookback window used when a command carries no `days=` option.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;
pub const MAX_LOOKBACK_DAYS: i64 = 3650;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    List {
        days: i64,
        limit: usize,
    },
    Category {
        name: String,
        days: i64,
        limit: usize,
    },
    Currency {
        code: String,
        days: i64,
        limit: usize,
    },
    Summary {
        days: i64,
        currency: Option<String>,
    },
    /// `None` means the month of the message.
    Month {
        month: Option<(i32, u32)>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::List { .. } => "list",
            Command::Category { .. } => "category",
            Command::Currency { .. } => "currency",
            Command::Summary { .. } => "summary",
            Command::Month { .. } => "month",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: Command,
    pub rows: Vec<Transaction>,
    pub totals: Vec<CategoryTotal>,
    pub text: String,
}

const HELP_TEXT: &str = "Send an expense as \"<amount> [CUR] [category] [notes]\", e.g. \"45.50 coffee\".\n\
\n\
Commands:\n\
!list [days=N] [limit=N] - recent transactions\n\
!category <name> [days=N] [limit=N] - transactions in one category\n\
!currency <CODE> [days=N] [limit=N] - transactions in one currency\n\
!summary [days=N] [currency=CODE] - totals per category\n\
!month [YYYY-MM] - totals for one calendar month\n\
\n\
Windows default to the last 30 days.";

struct Args<'a> {
    command: &'a str,
    positional: Vec<&'a str>,
    options: BTreeMap<&'a str, &'a str>,
}

impl<'a> Args<'a> {
    fn split(command: &'a str, rest: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut positional = Vec::new();
        let mut options = BTreeMap::new();
        for tok in rest {
            match tok.split_once('=') {
                Some((k, v)) if !k.is_empty() && !v.is_empty() => {
                    if options.insert(k, v).is_some() {
                        return Err(bad_param(command, format!("option '{k}' given twice")));
                    }
                }
                Some(_) => return Err(bad_param(command, format!("malformed option '{tok}'"))),
                None => positional.push(tok),
            }
        }
        Ok(Self {
            command,
            positional,
            options,
        })
    }

    fn allow(&self, keys: &[&str], max_positional: usize) -> Result<()> {
        if let Some(k) = self.options.keys().find(|k| !keys.contains(*k)) {
            return Err(bad_param(self.command, format!("unknown option '{k}'")));
        }
        if self.positional.len() > max_positional {
            return Err(bad_param(
                self.command,
                format!("unexpected argument '{}'", self.positional[max_positional]),
            ));
        }
        Ok(())
    }

    fn required(&self, what: &str) -> Result<&'a str> {
        self.positional
            .first()
            .copied()
            .ok_or_else(|| bad_param(self.command, format!("missing {what}")))
    }

    fn days(&self) -> Result<i64> {
        match self.options.get("days") {
            None => Ok(DEFAULT_LOOKBACK_DAYS),
            Some(raw) => match raw.parse::<i64>() {
                Ok(d) if (1..=MAX_LOOKBACK_DAYS).contains(&d) => Ok(d),
                _ => Err(bad_param(
                    self.command,
                    format!("days must be between 1 and {MAX_LOOKBACK_DAYS} (got '{raw}')"),
                )),
            },
        }
    }

    fn limit(&self) -> Result<usize> {
        match self.options.get("limit") {
            None => Ok(DEFAULT_LIMIT),
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
                _ => Err(bad_param(
                    self.command,
                    format!("limit must be between 1 and {MAX_LIMIT} (got '{raw}')"),
                )),
            },
        }
    }
}

fn bad_param(command: &str, detail: String) -> Error {
    Error::validation(
        format!("!{command}: {detail}"),
        format!("Invalid arguments for !{command}: {detail}. Send !help for usage."),
    )
}

fn currency_arg(command: &str, raw: &str) -> Result<String> {
    let code = raw.to_uppercase();
    if !is_currency_code(&code) {
        return Err(bad_param(
            command,
            format!("'{raw}' is not a three-letter currency code"),
        ));
    }
    Ok(code)
}

fn month_arg(raw: &str) -> Result<(i32, u32)> {
    let parsed = raw
        .split_once('-')
        .and_then(|(y, m)| Some((y.parse::<i32>().ok()?, m.parse::<u32>().ok()?)))
        .filter(|(y, m)| *y >= 1970 && NaiveDate::from_ymd_opt(*y, *m, 1).is_some());
    parsed.ok_or_else(|| bad_param("month", format!("'{raw}' is not a month like 2026-03")))
}

/// Parse command text (with or without the leading `!`).
pub fn parse_command(text: &str) -> Result<Command> {
    let text = text.trim().trim_start_matches('!');
    let mut parts = text.split_whitespace();
    let Some(raw_name) = parts.next() else {
        return Err(Error::validation(
            "empty command",
            "Empty command. Send !help for the list of commands.",
        ));
    };
    let name = raw_name.to_lowercase();
    let args = Args::split(raw_name, parts)?;

    match name.as_str() {
        "help" => {
            args.allow(&[], 0)?;
            Ok(Command::Help)
        }
        "list" | "recent" => {
            args.allow(&["days", "limit"], 0)?;
            Ok(Command::List {
                days: args.days()?,
                limit: args.limit()?,
            })
        }
        "category" => {
            args.allow(&["days", "limit"], 1)?;
            Ok(Command::Category {
                name: args.required("category name")?.to_lowercase(),
                days: args.days()?,
                limit: args.limit()?,
            })
        }
        "currency" => {
            args.allow(&["days", "limit"], 1)?;
            Ok(Command::Currency {
                code: currency_arg("currency", args.required("currency code")?)?,
                days: args.days()?,
                limit: args.limit()?,
            })
        }
        "summary" | "total" => {
            args.allow(&["days", "currency"], 0)?;
            let currency = args
                .options
                .get("currency")
                .map(|c| currency_arg("summary", c))
                .transpose()?;
            Ok(Command::Summary {
                days: args.days()?,
                currency,
            })
        }
        "month" | "stats" => {
            args.allow(&[], 1)?;
            let month = args.positional.first().map(|m| month_arg(m)).transpose()?;
            Ok(Command::Month { month })
        }
        _ => Err(Error::UnknownCommand(name)),
    }
}

/// Executes reporting commands against the ledger.
#[derive(Clone)]
pub struct CommandDispatcher {
    transactions: Arc<dyn TransactionStore>,
}

impl CommandDispatcher {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }

    pub async fn dispatch(
        &self,
        command_text: &str,
        timestamp: DateTime<Utc>,
        account_id: AccountId,
    ) -> Result<CommandOutput> {
        let command = parse_command(command_text)?;
        tracing::debug!(account = %account_id, command = command.name(), "dispatching command");

        let mut out = CommandOutput {
            command: command.clone(),
            rows: Vec::new(),
            totals: Vec::new(),
            text: String::new(),
        };

        match command {
            Command::Help => out.text = HELP_TEXT.to_string(),
            Command::List { days, limit } => {
                out.rows = self
                    .list(account_id, timestamp, days, limit, None, None)
                    .await?;
                out.text = render_rows(&format!("Last {days} days"), &out.rows);
            }
            Command::Category { name, days, limit } => {
                out.rows = self
                    .list(account_id, timestamp, days, limit, Some(name.clone()), None)
                    .await?;
                out.text = render_rows(&format!("'{name}' in the last {days} days"), &out.rows);
            }
            Command::Currency { code, days, limit } => {
                out.rows = self
                    .list(account_id, timestamp, days, limit, None, Some(code.clone()))
                    .await?;
                out.text = render_rows(&format!("{code} in the last {days} days"), &out.rows);
            }
            Command::Summary { days, currency } => {
                let since = timestamp - TimeDelta::days(days);
                out.totals = self
                    .transactions
                    .category_totals(account_id, since, timestamp, currency.as_deref())
                    .await?;
                out.text =
                    render_totals(&format!("Spending in the last {days} days"), &out.totals)?;
            }
            Command::Month { month } => {
                let (year, month) = month.unwrap_or((timestamp.year(), timestamp.month()));
                let (since, until) = month_bounds(year, month)?;
                out.totals = self
                    .transactions
                    .category_totals(account_id, since, until, None)
                    .await?;
                out.text = render_totals(&since.format("%B %Y").to_string(), &out.totals)?;
            }
        }

        Ok(out)
    }

    async fn list(
        &self,
        account_id: AccountId,
        until: DateTime<Utc>,
        days: i64,
        limit: usize,
        category: Option<String>,
        currency: Option<String>,
    ) -> Result<Vec<Transaction>> {
        let query = TransactionQuery {
            since: until - TimeDelta::days(days),
            until,
            category,
            currency,
            limit,
        };
        self.transactions.list_transactions(account_id, &query).await
    }
}

/// `[first instant of the month, last microsecond of the month]`.
fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let next = Utc.with_ymd_and_hms(next_y, next_m, 1, 0, 0, 0).single();
    match (start, next) {
        (Some(start), Some(next)) => Ok((start, next - TimeDelta::microseconds(1))),
        _ => Err(bad_param("month", format!("{year}-{month:02} is out of range"))),
    }
}

fn render_rows(title: &str, rows: &[Transaction]) -> String {
    if rows.is_empty() {
        return format!("{title}: no transactions.");
    }
    let mut out = format!("{title}: {} transaction(s)", rows.len());
    for t in rows {
        out.push('\n');
        out.push_str(&format!(
            "{} {} {} {}",
            t.timestamp.format("%Y-%m-%d"),
            format_cents(t.amount_cents),
            t.currency,
            t.category
        ));
        if !t.notes.is_empty() {
            out.push_str(&format!(" ({})", t.notes));
        }
    }
    out
}

fn render_totals(title: &str, totals: &[CategoryTotal]) -> Result<String> {
    if totals.is_empty() {
        return Ok(format!("{title}: no transactions."));
    }
    let mut out = format!("{title}:");
    let mut per_currency: BTreeMap<&str, (Cents, i64)> = BTreeMap::new();
    for t in totals {
        out.push_str(&format!(
            "\n{}: {} {} ({})",
            t.category,
            format_cents(t.total_cents),
            t.currency,
            t.count
        ));
        let e = per_currency.entry(t.currency.as_str()).or_insert((0, 0));
        e.0 = e.0.checked_add(t.total_cents).ok_or_else(|| {
            Error::validation(
                format!("{} total overflows i64 cents", t.currency),
                "Totals are too large to add up. Narrow the window with days= or currency=.",
            )
        })?;
        e.1 += t.count;
    }
    for (currency, (cents, count)) in per_currency {
        out.push_str(&format!(
            "\nTotal: {} {currency} across {count} transaction(s)",
            format_cents(cents)
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Account, TransactionId},
        errors::ErrorKind,
        ports::AccountStore,
        recorder::MAX_AMOUNT_CENTS,
        store::memory::InMemoryStore,
    };

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn tx(account: AccountId, cents: Cents, cur: &str, cat: &str, at: DateTime<Utc>) -> Transaction {
        Transaction {
            id: TransactionId(uuid::Uuid::new_v4()),
            account_id: account,
            amount_cents: cents,
            currency: cur.to_string(),
            category: cat.to_string(),
            notes: String::new(),
            timestamp: at,
            hash: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn seeded() -> (Arc<InMemoryStore>, CommandDispatcher, AccountId) {
        let store = Arc::new(InMemoryStore::new());
        let account = Account::new("aroha", "NZD");
        store.insert_account(&account).await.unwrap();
        let id = account.id;
        for t in [
            tx(id, 4550, "NZD", "coffee", ts(2026, 6, 20)),
            tx(id, 1200, "NZD", "lunch", ts(2026, 6, 25)),
            tx(id, 500, "USD", "coffee", ts(2026, 6, 28)),
            tx(id, 9900, "NZD", "rent", ts(2026, 4, 1)),
        ] {
            store.insert_transaction(&t).await.unwrap();
        }
        let dispatcher = CommandDispatcher::new(store.clone());
        (store, dispatcher, id)
    }

    #[test]
    fn default_window_is_thirty_days() {
        assert_eq!(DEFAULT_LOOKBACK_DAYS, 30);
        assert_eq!(
            parse_command("!list").unwrap(),
            Command::List {
                days: 30,
                limit: DEFAULT_LIMIT
            }
        );
        assert_eq!(
            parse_command("summary").unwrap(),
            Command::Summary {
                days: 30,
                currency: None
            }
        );
    }

    #[test]
    fn parses_parameters() {
        assert_eq!(
            parse_command("!category Coffee days=7 limit=3").unwrap(),
            Command::Category {
                name: "coffee".into(),
                days: 7,
                limit: 3
            }
        );
        assert_eq!(
            parse_command("!currency usd").unwrap(),
            Command::Currency {
                code: "USD".into(),
                days: 30,
                limit: DEFAULT_LIMIT
            }
        );
        assert_eq!(
            parse_command("!summary currency=nzd days=90").unwrap(),
            Command::Summary {
                days: 90,
                currency: Some("NZD".into())
            }
        );
        assert_eq!(
            parse_command("!month 2026-04").unwrap(),
            Command::Month {
                month: Some((2026, 4))
            }
        );
    }

    #[test]
    fn malformed_parameters_are_validation_errors() {
        for bad in [
            "!list days=0",
            "!list days=abc",
            "!list limit=1000",
            "!list extra",
            "!list sort=asc",
            "!list days=1 days=2",
            "!list days=",
            "!category",
            "!currency dollars",
            "!month 2026-13",
            "!month june",
        ] {
            let err = parse_command(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
            assert!(err.user_message().contains("!help"), "{bad}");
        }
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let err = parse_command("!frobnicate now").unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(ref n) if n == "frobnicate"));
        assert!(err.user_message().contains("!frobnicate"));
    }

    #[tokio::test]
    async fn list_uses_window_anchored_at_message_time() {
        let (_store, dispatcher, account) = seeded().await;
        let out = dispatcher
            .dispatch("!list", ts(2026, 7, 1), account)
            .await
            .unwrap();
        // The April rent is outside the default 30-day window.
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[0].currency, "USD"); // newest first
        assert!(out.text.starts_with("Last 30 days: 3 transaction(s)"));

        let out = dispatcher
            .dispatch("!list days=120 limit=2", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 2);
    }

    #[tokio::test]
    async fn filters_by_category_and_currency() {
        let (_store, dispatcher, account) = seeded().await;
        let out = dispatcher
            .dispatch("!category coffee", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 2);
        assert!(out.rows.iter().all(|t| t.category == "coffee"));

        let out = dispatcher
            .dispatch("!currency USD", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn summary_and_month_totals() {
        let (_store, dispatcher, account) = seeded().await;
        let out = dispatcher
            .dispatch("!summary currency=NZD", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert_eq!(out.totals.len(), 2);
        assert_eq!(out.totals[0].category, "coffee");
        assert!(out.text.contains("Total: 57.50 NZD across 2 transaction(s)"));

        let out = dispatcher
            .dispatch("!month 2026-04", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert_eq!(out.totals.len(), 1);
        assert!(out.text.starts_with("April 2026:"));

        let out = dispatcher
            .dispatch("!month", ts(2026, 6, 30), account)
            .await
            .unwrap();
        assert_eq!(out.totals.iter().map(|t| t.count).sum::<i64>(), 3);
    }

    #[tokio::test]
    async fn summary_of_largest_amounts_adds_up() {
        let (store, dispatcher, account) = seeded().await;
        for cat in ["a", "b", "c"] {
            store
                .insert_transaction(&tx(account, MAX_AMOUNT_CENTS, "NZD", "big", ts(2026, 6, 29)))
                .await
                .unwrap();
            store
                .insert_transaction(&tx(account, MAX_AMOUNT_CENTS, "NZD", cat, ts(2026, 6, 29)))
                .await
                .unwrap();
        }
        let out = dispatcher
            .dispatch("summary", ts(2026, 7, 1), account)
            .await
            .unwrap();
        let big = out.totals.iter().find(|t| t.category == "big").unwrap();
        assert_eq!(big.total_cents, 3 * MAX_AMOUNT_CENTS);
        assert_eq!(big.count, 3);
        assert!(out
            .text
            .contains("Total: 6000000057.50 NZD across 8 transaction(s)"));
    }

    #[test]
    fn overflowing_grand_total_is_a_user_error() {
        let total = |category: &str| CategoryTotal {
            category: category.to_string(),
            currency: "NZD".to_string(),
            total_cents: i64::MAX - 1,
            count: 1,
        };
        let err = render_totals("Spending", &[total("a"), total("b")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn help_and_empty_results_render_text() {
        let (_store, dispatcher, account) = seeded().await;
        let out = dispatcher
            .dispatch("!help", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert!(out.text.contains("!summary"));

        let out = dispatcher
            .dispatch("!category travel", ts(2026, 7, 1), account)
            .await
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.text, "'travel' in the last 30 days: no transactions.");
    }
}
