use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Naive UTC format found in older `last_run.txt` files.
const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339 and the legacy naive format (read as UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, LEGACY_FORMAT).ok().map(|n| n.and_utc())
}
