use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tally_core::{
    config::Config,
    domain::{Account, AccountId},
    ingest::IngestionLoop,
    linking::LinkingService,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    ports::AccountStore,
};
use tally_sqlite::SqliteStore;
use tally_telegram::{build_bot, bot_username, TelegramMessenger, TelegramUpdates};

/// Tally - expense tracking over chat
#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Chat bot that records expenses and reports on them")]
#[command(version)]
pub struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot (default)
    Run,

    /// Create or upgrade the database schema
    Migrate,

    /// Account management commands
    #[command(subcommand)]
    Account(AccountCommands),
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create a new account
    Create {
        #[arg(long)]
        username: String,

        #[arg(long, default_value = "")]
        first_name: String,

        #[arg(long, default_value = "")]
        last_name: String,

        /// Preferred currency (defaults to DEFAULT_CURRENCY)
        #[arg(long)]
        currency: Option<String>,
    },

    /// Issue a fresh link code for an account
    LinkCode {
        /// Account ID
        id: Uuid,
    },

    /// Show an account and its linked identities
    Show {
        /// Account ID
        id: Uuid,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut cfg = Config::load().context("Failed to load configuration")?;
        if let Some(url) = self.database_url {
            cfg.database_url = url;
        }
        let store = Arc::new(
            SqliteStore::init(&cfg.database_url)
                .await
                .context("Failed to open database")?,
        );

        match self.command.unwrap_or(Commands::Run) {
            Commands::Run => run_bot(&cfg, store).await,
            Commands::Migrate => {
                // `init` already migrated.
                println!("Database ready: {}", cfg.database_url);
                Ok(())
            }
            Commands::Account(cmd) => run_account(&cfg, store, cmd).await,
        }
    }
}

async fn run_bot(cfg: &Config, store: Arc<SqliteStore>) -> Result<()> {
    let bot = build_bot(cfg.require_bot_token()?, cfg.poll_timeout)?;
    match bot_username(&bot).await {
        Ok(name) => tracing::info!(bot = %name, "tally started"),
        Err(e) => tracing::warn!(error = %e, "could not fetch bot identity"),
    }

    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let source = Arc::new(TelegramUpdates::new(bot));

    let ingest = IngestionLoop::wire(store, source, messenger, cfg);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    ingest.run(cancel).await?;
    Ok(())
}

async fn run_account(cfg: &Config, store: Arc<SqliteStore>, cmd: AccountCommands) -> Result<()> {
    match cmd {
        AccountCommands::Create {
            username,
            first_name,
            last_name,
            currency,
        } => {
            let currency = currency
                .map(|c| c.trim().to_uppercase())
                .unwrap_or_else(|| cfg.default_currency.clone());
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                bail!("Currency must be a three-letter code (got '{currency}')");
            }

            let mut account = Account::new(username.trim(), currency);
            account.first_name = first_name;
            account.last_name = last_name;
            store
                .insert_account(&account)
                .await
                .context("Failed to create account")?;
            println!("Created account {} ({})", account.id, account.username);
        }
        AccountCommands::LinkCode { id } => {
            let linking = LinkingService::new(store);
            let code = linking
                .issue_link_code(AccountId(id), cfg.link_code_ttl)
                .await
                .context("Failed to issue link code")?;
            println!("Link code: {}", code.code);
            println!("Expires:   {}", code.expires.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Send `/start {}` to the bot to link a chat.", code.code);
        }
        AccountCommands::Show { id } => {
            let id = AccountId(id);
            let Some(account) = store.account_by_id(id).await? else {
                bail!("Account not found: {id}");
            };
            println!("Account:   {}", account.id);
            println!("Username:  {}", account.username);
            println!("Name:      {}", account.display_name());
            println!("Currency:  {}", account.preferred_currency);
            match account.link_code_expires {
                Some(expires) => println!("Link code: pending (expires {expires})"),
                None => println!("Link code: none"),
            }

            let identities = store.identities_for_account(id).await?;
            if identities.is_empty() {
                println!("No linked identities.");
            }
            for identity in identities {
                println!(
                    "  {}:{} {} (linked {})",
                    identity.provider,
                    identity.provider_user_id,
                    identity.display_name.as_deref().unwrap_or(""),
                    identity.created_at.format("%Y-%m-%d")
                );
            }
        }
    }
    Ok(())
}
