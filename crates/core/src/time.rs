use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::error::{Result, ScrapeError};

const TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Unix timestamps above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub duration: TimeDelta,
    pub origin: String,
}

impl Period {
    pub fn new(duration: Duration, origin: impl Into<String>) -> Self {
        Self {
            duration: TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX),
            origin: origin.into(),
        }
    }

    // Never cached: a relative origin has to track the wall clock across cycles.
    pub fn resolve(&self) -> TimeWindow {
        resolve(self.duration, &self.origin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn start_secs(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_secs(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn start_text(&self) -> String {
        self.start.format(TEXT_FORMAT).to_string()
    }

    pub fn end_text(&self) -> String {
        self.end.format(TEXT_FORMAT).to_string()
    }

    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

pub fn resolve(duration: TimeDelta, origin: &str) -> TimeWindow {
    resolve_at(Utc::now(), duration, origin)
}

pub fn resolve_at(now: DateTime<Utc>, duration: TimeDelta, origin: &str) -> TimeWindow {
    let start = parse_origin(origin, now).unwrap_or(now);
    let end = start
        .checked_add_signed(duration)
        .unwrap_or(if duration < TimeDelta::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });

    if start > end {
        TimeWindow {
            start: end,
            end: start,
        }
    } else {
        TimeWindow { start, end }
    }
}

pub fn parse_origin(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(rest) = input.strip_prefix("now") {
        let rest = rest.trim();
        if rest.is_empty() {
            return Some(now);
        }
        if let Some(ago) = rest.strip_prefix('-') {
            return now.checked_sub_signed(parse_delta(ago)?);
        }
        if let Some(ahead) = rest.strip_prefix('+') {
            return now.checked_add_signed(parse_delta(ahead)?);
        }
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(raw) = input.parse::<i64>() {
        return if raw.abs() >= MILLIS_THRESHOLD {
            Utc.timestamp_millis_opt(raw).single()
        } else {
            Utc.timestamp_opt(raw, 0).single()
        };
    }

    now.checked_sub_signed(parse_delta(input)?)
}

fn parse_delta(input: &str) -> Option<TimeDelta> {
    let duration = humantime::parse_duration(input.trim()).ok()?;
    TimeDelta::from_std(duration).ok()
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| ScrapeError::Parse(format!("invalid duration {input}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn unparsable_origin_falls_back_to_now() {
        let before = Utc::now();
        let window = resolve(TimeDelta::seconds(5), "");
        let after = Utc::now();
        assert!(window.start >= before && window.start <= after);
        assert_eq!(window.span(), TimeDelta::seconds(5));

        let window = resolve_at(fixed_now(), TimeDelta::seconds(5), "next tuesday");
        assert_eq!(window.start, fixed_now());
        assert_eq!(window.end, fixed_now() + TimeDelta::seconds(5));
    }

    #[test]
    fn relative_origins() {
        let now = fixed_now();
        let window = resolve_at(now, TimeDelta::minutes(5), "now-5m");
        assert_eq!(window.start, now - TimeDelta::minutes(5));
        assert_eq!(window.end, now);

        let window = resolve_at(now, TimeDelta::minutes(1), "now + 1h");
        assert_eq!(window.start, now + TimeDelta::hours(1));

        let window = resolve_at(now, TimeDelta::minutes(1), "15m");
        assert_eq!(window.start, now - TimeDelta::minutes(15));
    }

    #[test]
    fn absolute_origins() {
        let now = fixed_now();
        let window = resolve_at(now, TimeDelta::minutes(1), "2026-01-01T00:00:00Z");
        assert_eq!(window.start_text(), "2026-01-01 00:00:00");
        assert_eq!(window.end_text(), "2026-01-01 00:01:00");

        let window = resolve_at(now, TimeDelta::zero(), "1620000000");
        assert_eq!(window.start_secs(), 1_620_000_000);

        let window = resolve_at(now, TimeDelta::zero(), "1620000000000");
        assert_eq!(window.start_millis(), 1_620_000_000_000);
    }

    #[test]
    fn start_never_after_end() {
        let now = fixed_now();
        let durations = [
            TimeDelta::seconds(-30),
            TimeDelta::zero(),
            TimeDelta::hours(3),
            TimeDelta::MAX,
            TimeDelta::MIN,
        ];
        let origins = ["", "now", "now-1h", "now+2d", "garbage", "0", "2026-01-01T00:00:00Z"];
        for duration in durations {
            for origin in origins {
                let window = resolve_at(now, duration, origin);
                assert!(window.start <= window.end, "{origin} {duration}");
            }
        }
    }

    #[test]
    fn negative_duration_is_swapped() {
        let now = fixed_now();
        let window = resolve_at(now, TimeDelta::seconds(-30), "now");
        assert_eq!(window.start, now - TimeDelta::seconds(30));
        assert_eq!(window.end, now);
    }

    #[test]
    fn period_resolves_freshly() {
        let period = Period::new(Duration::from_secs(60), "now-1m");
        let first = period.resolve();
        std::thread::sleep(Duration::from_millis(5));
        let second = period.resolve();
        assert!(second.start > first.start);
    }
}
