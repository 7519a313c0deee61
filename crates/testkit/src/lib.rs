pub mod fake;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use grafscrape_collect::sink::{Fields, Sink};
use grafscrape_core::config::Config;
use grafscrape_core::model::point::Tags;
use serde_json::{Value, json};

pub use fake::{Backend, FakeGrafana, FakeGrafanaBuilder, ProxiedRequest};

pub const PROMETHEUS_ID: i64 = 1;
pub const ELASTIC_ID: i64 = 2;
pub const SLOW_PROMETHEUS_ID: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPoint {
    pub measurement: String,
    pub fields: Fields,
    pub tags: Tags,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    points: Mutex<Vec<RecordedPoint>>,
}

impl RecordingSink {
    pub fn points(&self) -> Vec<RecordedPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for RecordingSink {
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags, ts: DateTime<Utc>) {
        if let Ok(mut points) = self.points.lock() {
            points.push(RecordedPoint {
                measurement: measurement.to_string(),
                fields,
                tags,
                ts,
            });
        }
    }
}

pub fn sample_datasources() -> Value {
    json!([
        {"id": PROMETHEUS_ID, "uid": "prom", "name": "Prometheus", "type": "prometheus",
         "access": "proxy", "isDefault": true},
        {"id": ELASTIC_ID, "uid": "logs", "name": "Logs", "type": "elasticsearch",
         "access": "proxy", "database": "logs-*", "jsonData": {"timeField": "@timestamp"}},
        {"id": SLOW_PROMETHEUS_ID, "uid": "slow", "name": "Slow Prometheus", "type": "prometheus",
         "access": "proxy", "jsonData": {"httpMethod": "POST"}},
        {"id": 4, "uid": "direct", "name": "Direct", "type": "influxdb", "access": "direct"},
        {"id": 5, "uid": "graphite", "name": "Graphite", "type": "graphite", "access": "proxy"}
    ])
}

pub fn sample_dashboard() -> Value {
    json!({
        "uid": "svc",
        "title": "Service Overview",
        "panels": [
            {"type": "row", "title": "API", "panels": []},
            {"type": "graph", "title": "Requests", "targets": [
                {"refId": "A", "expr": "sum(rate(http_requests_total[1m])) by (code)"}
            ]},
            {"type": "timeseries", "title": "Mixed Latency", "targets": [
                {"refId": "A", "datasource": {"uid": "slow"}, "expr": "histogram_quantile(0.99, rate(latency_bucket[1m]))"},
                {"refId": "B", "datasource": "Logs", "query": "service:api",
                 "bucketAggs": [
                    {"id": "2", "type": "terms", "field": "host"},
                    {"id": "3", "type": "date_histogram", "settings": {"interval": "auto"}}
                 ],
                 "metrics": [{"id": "1", "type": "count"}]}
            ]},
            {"type": "graph", "title": "Legacy", "targets": [
                {"refId": "A", "datasource": "Direct", "query": "SELECT 1"},
                {"refId": "B", "datasource": "Graphite", "target": "a.b.c"}
            ]},
            {"type": "row", "title": "Internal", "collapsed": true, "panels": [
                {"type": "graph", "title": "GC Pauses", "targets": [{"refId": "A", "expr": "gc_pause"}]}
            ]}
        ]
    })
}

pub fn prometheus_matrix(series: &[(&[(&str, &str)], &[(i64, &str)])]) -> Value {
    let result: Vec<Value> = series
        .iter()
        .map(|(labels, values)| {
            let metric: serde_json::Map<String, Value> = labels
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect();
            let values: Vec<Value> = values.iter().map(|(ts, v)| json!([ts, v])).collect();
            json!({"metric": metric, "values": values})
        })
        .collect();
    json!({"status": "success", "data": {"resultType": "matrix", "result": result}})
}

pub fn elastic_terms_histogram(hosts: &[(&str, i64, u64)]) -> Value {
    let buckets: Vec<Value> = hosts
        .iter()
        .map(|(host, ts, count)| {
            json!({
                "key": host,
                "doc_count": count,
                "3": {"buckets": [
                    {"key": ts, "key_as_string": ts.to_string(), "doc_count": count}
                ]}
            })
        })
        .collect();
    json!({"responses": [{"status": 200, "aggregations": {"2": {"buckets": buckets}}}]})
}

pub fn sample_config(url: &str, extra: &str) -> Config {
    let raw = format!(
        r#"
url = "{url}"
api_key = "test-key"
dashboards = ["svc"]
max_concurrent_fetches = 4

[defaults]
duration = "5m"
origin = "now-5m"
interval = "1m"
timeout = "5s"

{extra}
"#
    );
    Config::from_toml_str(&raw).unwrap_or_else(|e| panic!("invalid test config: {e}"))
}
