//! Structural validation of raw events and timestamp normalization.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::bus::{EventType, RawEvent};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// True only if `id`, `session_id`, a resolvable timestamp and a recognized
/// event type are all present.
pub fn validate(raw: &RawEvent) -> bool {
    non_blank(raw.id.as_deref())
        && non_blank(raw.session_id.as_deref())
        && raw.timestamp.as_ref().and_then(parse_timestamp).is_some()
        && raw
            .event_type
            .as_deref()
            .and_then(|t| t.parse::<EventType>().ok())
            .is_some()
}

/// Resolve a wire timestamp into a UTC instant.
///
/// Accepts RFC 3339 strings, zone-less ISO-8601 strings (read as UTC), and
/// epoch milliseconds given as a JSON number or a numeric string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            if let Some(millis) = n.as_i64() {
                DateTime::from_timestamp_millis(millis)
            } else {
                n.as_f64().and_then(millis_from_f64)
            }
        }
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(millis) = s.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }
    None
}

fn millis_from_f64(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_millis(millis.round() as i64)
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}
