use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::DEFAULT_CURRENCY, errors::Error, fingerprint::DedupBucket, Result};

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Transport
    pub telegram_bot_token: Option<String>,
    pub poll_timeout: Duration,
    pub retry_backoff: Duration,

    // Store
    pub database_url: String,

    // Ledger policy
    pub link_code_ttl: Duration,
    pub dedup_bucket: DedupBucket,
    pub default_currency: String,

    // Audit
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests inject a map here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN");
        let poll_timeout = Duration::from_secs(parse_num(&get, "POLL_TIMEOUT_SECS")?.unwrap_or(60));
        let retry_backoff =
            Duration::from_millis(parse_num(&get, "RETRY_BACKOFF_MS")?.unwrap_or(2_000));

        let database_url =
            get("DATABASE_URL").unwrap_or_else(|| "sqlite:tally.db?mode=rwc".to_string());

        let ttl_minutes: u64 = parse_num(&get, "LINK_CODE_TTL_MINUTES")?.unwrap_or(15);
        if ttl_minutes == 0 {
            return Err(Error::Config(
                "LINK_CODE_TTL_MINUTES must be greater than zero".to_string(),
            ));
        }
        let link_code_ttl = Duration::from_secs(ttl_minutes * 60);

        let dedup_bucket = match get("DEDUP_BUCKET") {
            Some(raw) => DedupBucket::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "DEDUP_BUCKET must be one of day, hour, minute (got '{raw}')"
                ))
            })?,
            None => DedupBucket::default(),
        };

        let default_currency = get("DEFAULT_CURRENCY")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        if !is_currency_code(&default_currency) {
            return Err(Error::Config(format!(
                "DEFAULT_CURRENCY must be a three-letter ISO code (got '{default_currency}')"
            )));
        }

        let audit_log_path = get("AUDIT_LOG_PATH").map(PathBuf::from);
        let audit_log_json = get("AUDIT_LOG_JSON").map(|s| parse_bool(&s)).unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            poll_timeout,
            retry_backoff,
            database_url,
            link_code_ttl,
            dedup_bucket,
            default_currency,
            audit_log_path,
            audit_log_json,
        })
    }

    pub fn require_bot_token(&self) -> Result<&str> {
        self.telegram_bot_token.as_deref().ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })
    }
}

pub(crate) fn is_currency_code(s: &str) -> bool {
    s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase())
}

fn parse_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer (got '{raw}')"))),
        None => Ok(None),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.poll_timeout, Duration::from_secs(60));
        assert_eq!(c.link_code_ttl, Duration::from_secs(15 * 60));
        assert_eq!(c.dedup_bucket, DedupBucket::Day);
        assert_eq!(c.default_currency, "NZD");
        assert!(c.audit_log_path.is_none());
        assert!(c.require_bot_token().is_err());
    }

    #[test]
    fn reads_overrides() {
        let c = cfg(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("POLL_TIMEOUT_SECS", "5"),
            ("DEDUP_BUCKET", "Hour"),
            ("DEFAULT_CURRENCY", "usd"),
            ("AUDIT_LOG_JSON", "yes"),
        ])
        .unwrap();
        assert_eq!(c.require_bot_token().unwrap(), "123:abc");
        assert_eq!(c.poll_timeout, Duration::from_secs(5));
        assert_eq!(c.dedup_bucket, DedupBucket::Hour);
        assert_eq!(c.default_currency, "USD");
        assert!(c.audit_log_json);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(cfg(&[("DEDUP_BUCKET", "week")]), Err(Error::Config(_))));
        assert!(matches!(cfg(&[("POLL_TIMEOUT_SECS", "-1")]), Err(Error::Config(_))));
        assert!(matches!(cfg(&[("LINK_CODE_TTL_MINUTES", "0")]), Err(Error::Config(_))));
        assert!(matches!(cfg(&[("DEFAULT_CURRENCY", "EURO")]), Err(Error::Config(_))));
    }

    #[test]
    fn dotenv_does_not_override_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nTALLY_TEST_DOTENV_A=\"from file\"\nTALLY_TEST_DOTENV_B=file\n",
        )
        .unwrap();
        env::set_var("TALLY_TEST_DOTENV_B", "process");

        load_dotenv_if_present(&path);

        assert_eq!(env::var("TALLY_TEST_DOTENV_A").unwrap(), "from file");
        assert_eq!(env::var("TALLY_TEST_DOTENV_B").unwrap(), "process");
    }
}
