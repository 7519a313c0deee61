use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

// Unix timestamps above this are taken as milliseconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

pub fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn from_secs_f64(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

pub fn from_epoch_guess(raw: f64) -> Option<DateTime<Utc>> {
    if raw.abs() >= MILLIS_THRESHOLD {
        from_millis(raw as i64)
    } else {
        from_secs_f64(raw)
    }
}

pub fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => from_epoch_guess(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(raw) = s.parse::<f64>() {
                return from_epoch_guess(raw);
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

pub fn tag_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn interval_secs(interval: std::time::Duration) -> u64 {
    interval.as_secs().max(1)
}
