// src/catalog/timestamp.rs

//! Release date parsing
//!
//! Catalog producers disagree on how to write the UTC offset. All of these
//! are accepted and mean the same instant:
//!
//! - `2024-01-01T02:00:00+02:00` (colon form)
//! - `2024-01-01T02:00:00+0200` (compact form)
//! - `2024-01-01T00:00:00` (no offset, read as `+0000`)
//! - `2024-01-01T00:00:00Z`
//!
//! Fractional seconds and date-only strings are rejected.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

/// Format used to parse release dates and to write them back to the cache
pub const RELEASE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Parse a catalog release date into UTC
pub fn parse_release_date(raw: &str) -> Result<DateTime<Utc>> {
    let normalized = normalize_offset(raw.trim());

    DateTime::parse_from_str(&normalized, RELEASE_DATE_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::ParseError(format!("Invalid release date '{}': {}", raw, e)))
}

/// Render a timestamp the way the cache stores it
pub fn format_release_date(date: &DateTime<Utc>) -> String {
    date.format(RELEASE_DATE_FORMAT).to_string()
}

/// Rewrite the offset suffix into the compact `+HHMM` form
fn normalize_offset(s: &str) -> String {
    if let Some(stripped) = s.strip_suffix('Z') {
        return format!("{}+0000", stripped);
    }

    let bytes = s.as_bytes();
    let len = bytes.len();

    if len >= 6
        && matches!(bytes[len - 6], b'+' | b'-')
        && bytes[len - 5].is_ascii_digit()
        && bytes[len - 4].is_ascii_digit()
        && bytes[len - 3] == b':'
        && bytes[len - 2].is_ascii_digit()
        && bytes[len - 1].is_ascii_digit()
    {
        return format!("{}{}", &s[..len - 3], &s[len - 2..]);
    }

    if len >= 5 && matches!(bytes[len - 5], b'+' | b'-') {
        return s.to_string();
    }

    format!("{}+0000", s)
}
