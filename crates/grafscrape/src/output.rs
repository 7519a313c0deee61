use std::fmt::Write as _;
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use grafscrape_collect::{Fields, MetricSet, Sink};
use grafscrape_core::config::Config;
use grafscrape_core::model::point::Tags;

pub struct LineProtocolSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> LineProtocolSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Sink for LineProtocolSink<W> {
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags, ts: DateTime<Utc>) {
        let line = format_line(measurement, &fields, &tags, ts);
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(e) = writeln!(out, "{line}") {
            tracing::warn!(error = %e, "failed writing point");
        }
    }
}

pub fn format_line(measurement: &str, fields: &Fields, tags: &Tags, ts: DateTime<Utc>) -> String {
    let mut line = escape(measurement, &[',', ' ']);
    for (key, value) in tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(
            line,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        );
    }
    let rendered: Vec<String> = fields
        .iter()
        .map(|(key, value)| format!("{}={value}", escape(key, &[',', '=', ' '])))
        .collect();
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_millis().saturating_mul(1_000_000));
    let _ = write!(line, " {} {nanos}", rendered.join(","));
    line
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn print_check(cfg: &Config, metrics: Option<&MetricSet>) {
    println!("url: {}", cfg.url);
    println!("dashboards: {}", cfg.dashboards.join(", "));
    if !cfg.rows.is_empty() {
        println!("rows: {}", cfg.rows.join(", "));
    }
    println!(
        "measurement: {}  max_concurrent_fetches: {}  poll_interval: {}",
        cfg.measurement,
        cfg.max_concurrent_fetches,
        humantime::format_duration(cfg.poll_interval)
    );

    let Some(metrics) = metrics else {
        println!("metrics: none configured");
        return;
    };
    println!(
        "{:<20} {:<10} {:<12} {:<10} {:<10} PANELS",
        "METRIC", "DURATION", "ORIGIN", "INTERVAL", "TIMEOUT"
    );
    for def in metrics.iter() {
        let name = if def.is_uninstrumented() {
            "(skip)"
        } else {
            def.name.as_str()
        };
        let duration = def
            .period
            .duration
            .to_std()
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|_| "-".to_string());
        println!(
            "{:<20} {:<10} {:<12} {:<10} {:<10} {}",
            name,
            duration,
            def.period.origin,
            humantime::format_duration(def.interval).to_string(),
            humantime::format_duration(def.timeout).to_string(),
            def.panel_patterns().collect::<Vec<_>>().join(" | ")
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 3, 0, 0, 0).unwrap()
    }

    #[test]
    fn formats_escaped_line() {
        let mut fields = Fields::new();
        fields.insert("req rate".into(), 2.5);
        let mut tags = Tags::new();
        tags.insert("panel".into(), "API, p99=x".into());
        tags.insert("row".into(), String::new());

        assert_eq!(
            format_line("grafana", &fields, &tags, ts()),
            r"grafana,panel=API\,\ p99\=x req\ rate=2.5 1620000000000000000"
        );
    }

    #[test]
    fn sink_writes_one_line_per_point() {
        let sink = LineProtocolSink::new(Vec::new());
        let mut fields = Fields::new();
        fields.insert("up".into(), 1.0);
        sink.add_fields("grafana", fields.clone(), Tags::new(), ts());
        sink.add_fields("grafana", fields, Tags::new(), ts());

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            written,
            "grafana up=1 1620000000000000000\ngrafana up=1 1620000000000000000\n"
        );
    }
}
