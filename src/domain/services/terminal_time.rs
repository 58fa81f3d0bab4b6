//! Terminal timestamp decoding.
//!
//! EA builds disagree on time encoding: epoch seconds, epoch milliseconds,
//! numeric strings, ISO strings, and MT5's own `YYYY.MM.DD HH:MM:SS` all
//! appear in the wild. This module is the boundary's single time-decoding
//! authority; everything downstream works in `DateTime<Utc>`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A timestamp field as it arrives on the wire: a JSON number or a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeField {
    Numeric(f64),
    Text(String),
}

/// Anything at or above this magnitude is epoch milliseconds; below it,
/// epoch seconds. (1e12 seconds is the year 33658.)
const MILLIS_THRESHOLD: f64 = 1e12;

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() < MILLIS_THRESHOLD {
        value * 1000.0
    } else {
        value
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn from_text(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(numeric) = trimmed.parse::<f64>() {
        return from_epoch(numeric);
    }
    if let Ok(parsed) = trimmed.parse::<DateTime<Utc>>() {
        return Some(parsed);
    }
    // MT5 server-local formats; treated as UTC since the EA reports no zone.
    for format in ["%Y.%m.%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Decode a terminal-reported timestamp, or `None` if unparseable.
pub fn normalize_terminal_time(value: &TimeField) -> Option<DateTime<Utc>> {
    match value {
        TimeField::Numeric(n) => from_epoch(*n),
        TimeField::Text(s) => from_text(s),
    }
}

/// Convenience for optional wire fields.
pub fn normalize_optional(value: Option<&TimeField>) -> Option<DateTime<Utc>> {
    value.and_then(normalize_terminal_time)
}
