//! Timestamp codec for TEXT columns
//!
//! Rows are written in one canonical format but older databases carry
//! several textual encodings, so reading goes through an ordered list of
//! parsers and stops at the first one that succeeds.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// A single parse attempt.
type Parser = fn(&str) -> Option<DateTime<Utc>>;

const PARSERS: &[Parser] = &[parse_rfc3339, parse_go_string, parse_sqlite_naive, parse_unix_seconds];

/// Canonical storage form: RFC 3339, UTC, microsecond precision.
///
/// Fixed width, so lexical order in SQL equals chronological order.
pub fn format(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage form.
pub fn now() -> String {
    format(Utc::now())
}

/// Parse any timestamp format this store has ever written.
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    PARSERS.iter().find_map(|parser| parser(raw))
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `2024-05-01 12:00:00.123456789 +0000 UTC m=+0.000123`
fn parse_go_string(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next()?;
    if !offset.starts_with('+') && !offset.starts_with('-') {
        return None;
    }
    let joined = format!("{date} {time} {offset}");
    DateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// SQLite `CURRENT_TIMESTAMP`: naive, implicitly UTC.
fn parse_sqlite_naive(raw: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn canonical_format_round_trips() {
        let ts = noon();
        assert_eq!(format(ts), "2024-05-01T12:00:00.000000Z");
        assert_eq!(parse(&format(ts)), Some(ts));
    }

    #[test]
    fn accepts_rfc3339_with_offset() {
        assert_eq!(parse("2024-05-01T14:00:00+02:00"), Some(noon()));
    }

    #[test]
    fn accepts_go_time_string_with_monotonic_suffix() {
        let parsed = parse("2024-05-01 12:00:00.5 +0000 UTC m=+0.000123").unwrap();
        assert_eq!(parsed, noon() + chrono::Duration::milliseconds(500));
        assert_eq!(parse("2024-05-01 07:00:00 -0500 EST"), Some(noon()));
    }

    #[test]
    fn accepts_sqlite_current_timestamp() {
        assert_eq!(parse("2024-05-01 12:00:00"), Some(noon()));
    }

    #[test]
    fn accepts_unix_seconds() {
        assert_eq!(parse(&noon().timestamp().to_string()), Some(noon()));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("yesterday-ish"), None);
        assert_eq!(parse("2024-13-45 99:00:00"), None);
    }
}
