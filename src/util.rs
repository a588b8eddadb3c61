//! Utility functions for `agentsocial`.
//!
//! Identifier digests, timestamp encoding and small string helpers shared by
//! the service modules and the gateway.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from a SHA-256 digest for platform identifiers.
pub const ID_HEX_LEN: usize = 32;

/// Digest an ordered list of parts into a 32-character lowercase hex identifier.
///
/// Parts are length-prefixed before hashing so that `["ab", "c"]` and
/// `["a", "bc"]` produce different identifiers.
///
/// # Examples
/// ```ignore
/// use agentsocial::util::digest_id;
///
/// let a = digest_id(&["agent", "task-1"]);
/// assert_eq!(a.len(), 32);
/// assert_eq!(a, digest_id(&["agent", "task-1"]));
/// assert_ne!(a, digest_id(&["agen", "ttask-1"]));
/// ```
pub fn digest_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(ID_HEX_LEN);
    encoded
}

/// Encode a timestamp as RFC 3339 UTC with fixed microsecond precision.
///
/// The fixed width keeps lexicographic order equal to chronological order,
/// which the store relies on for every `created_at < ?` comparison.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in store: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Calendar date (UTC) in `YYYY-MM-DD` form, used by the daily quotas.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Operates on character boundaries so multi-byte UTF-8 input is never split.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Returns `true` when the trimmed value is empty.
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
