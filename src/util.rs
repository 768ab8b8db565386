//! Small shared helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp as RFC 3339 with fixed millisecond precision and a
/// `Z` suffix. Every persisted timestamp uses this format so that TEXT
/// columns order lexicographically in SQL comparisons (`next_check_at <=
/// now`, `excluded.last_seen >= last_seen`).
pub fn rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in the persisted timestamp format.
pub fn now_string() -> String {
    rfc3339_millis(Utc::now())
}

/// Parse a persisted timestamp back into `DateTime<Utc>`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
