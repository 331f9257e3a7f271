//! Content fingerprints for transaction deduplication.

use std::fmt::Write;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use sha2::{Digest, Sha256};

use crate::domain::{AccountId, Cents};

/// Time granularity folded into the fingerprint.
///
/// Two submissions with identical fields inside the same bucket are one transaction.
/// `Day` (UTC calendar day) is the default: a redelivered update always lands in
/// the same bucket as its first delivery, at the cost of merging two genuinely
/// identical purchases on the same day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupBucket {
    Minute,
    Hour,
    #[default]
    Day,
}

impl DedupBucket {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    fn width(self) -> TimeDelta {
        match self {
            Self::Minute => TimeDelta::minutes(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.width()).unwrap_or(ts)
    }
}

/// Semantic fields of a transaction that define its identity.
#[derive(Clone, Debug)]
pub struct FingerprintInput<'a> {
    pub account_id: AccountId,
    pub amount_cents: Cents,
    pub currency: &'a str,
    pub category: &'a str,
    pub notes: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Hex SHA-256 over the fields, length-prefixed so no two field splits collide.
pub fn fingerprint(input: &FingerprintInput<'_>, bucket: DedupBucket) -> String {
    let bucket_start = bucket.floor(input.timestamp).timestamp();

    let mut h = Sha256::new();
    for field in [
        input.account_id.to_string(),
        input.amount_cents.to_string(),
        input.currency.to_string(),
        input.category.to_string(),
        input.notes.to_string(),
        bucket_start.to_string(),
    ] {
        h.update((field.len() as u64).to_be_bytes());
        h.update(field.as_bytes());
    }
    to_hex(&h.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
