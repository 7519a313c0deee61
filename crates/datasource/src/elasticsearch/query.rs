use std::collections::HashMap;
use std::time::Duration;

use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::Target;
use grafscrape_core::model::datasource::DatasourceRef;
use grafscrape_core::time::TimeWindow;
use serde_json::{Map, Value, json};

use crate::decode::interval_secs;

pub const FALLBACK_TIME_FIELD: &str = "timestamp";
const AUTO_INTERVALS: [&str; 2] = ["auto", "$__interval"];
const DEFAULT_TERMS_SIZE: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOp {
    Avg,
    Min,
    Max,
    Sum,
}

impl MetricOp {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TermsOrder {
    Key,
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggKind {
    DateHistogram {
        interval: String,
        // Clusters before 7.2 only understand the single `interval` key.
        legacy_interval: bool,
    },
    Terms {
        size: u64,
        order_by: TermsOrder,
        descending: bool,
        min_doc_count: u64,
    },
    Metric(MetricOp),
}

impl AggKind {
    pub fn is_bucket(&self) -> bool {
        !matches!(self, Self::Metric(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggNode {
    pub name: String,
    pub kind: AggKind,
    pub field: String,
    children: Vec<AggNode>,
}

impl AggNode {
    pub fn new(name: impl Into<String>, kind: AggKind, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            field: field.into(),
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> &[AggNode] {
        &self.children
    }

    pub fn push_child(&mut self, child: AggNode) -> Result<()> {
        if !self.kind.is_bucket() {
            return Err(ScrapeError::Internal(format!(
                "metric aggregation {} cannot have children",
                self.name
            )));
        }
        self.children.push(child);
        Ok(())
    }

    fn deepest_mut(&mut self) -> &mut AggNode {
        match self.children.iter().position(|c| c.kind.is_bucket()) {
            Some(idx) => self.children[idx].deepest_mut(),
            None => self,
        }
    }

    pub fn to_json(&self, window: &TimeWindow) -> Value {
        let body = match &self.kind {
            AggKind::DateHistogram {
                interval,
                legacy_interval,
            } => {
                let interval_key = if *legacy_interval {
                    "interval"
                } else if is_calendar_interval(interval) {
                    "calendar_interval"
                } else {
                    "fixed_interval"
                };
                json!({
                    "date_histogram": {
                        "field": self.field,
                        interval_key: interval,
                        "min_doc_count": 0,
                        "format": "epoch_millis",
                        "extended_bounds": {
                            "min": window.start_millis(),
                            "max": window.end_millis(),
                        },
                    }
                })
            }
            AggKind::Terms {
                size,
                order_by,
                descending,
                min_doc_count,
            } => {
                let order_key = match order_by {
                    TermsOrder::Key => "_key",
                    TermsOrder::Count => "_count",
                };
                json!({
                    "terms": {
                        "field": self.field,
                        "size": size,
                        "min_doc_count": min_doc_count,
                        "order": { order_key: if *descending { "desc" } else { "asc" } },
                    }
                })
            }
            AggKind::Metric(op) => json!({ op.as_str(): { "field": self.field } }),
        };

        let mut body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if !self.children.is_empty() {
            body.insert("aggs".to_string(), children_json(&self.children, window));
        }
        Value::Object(body)
    }
}

fn children_json(children: &[AggNode], window: &TimeWindow) -> Value {
    let mut aggs = Map::new();
    for child in children {
        aggs.insert(child.name.clone(), child.to_json(window));
    }
    Value::Object(aggs)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggInfo {
    pub field: String,
    pub kind: AggKind,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub roots: Vec<AggNode>,
    pub aggs: HashMap<String, AggInfo>,
    pub time_field: String,
    pub query: String,
    pub index: String,
}

impl QueryPlan {
    pub fn lookup(&self, name: &str) -> Option<&AggInfo> {
        self.aggs.get(name)
    }

    pub fn search_body(&self, window: &TimeWindow) -> Value {
        json!({
            "size": 0,
            "query": {
                "bool": {
                    "filter": [
                        {"range": {self.time_field.as_str(): {
                            "gte": window.start_millis(),
                            "lte": window.end_millis(),
                            "format": "epoch_millis",
                        }}},
                        {"query_string": {"analyze_wildcard": true, "query": self.query}},
                    ]
                }
            },
            "aggs": children_json(&self.roots, window),
        })
    }

    pub fn msearch_payload(&self, window: &TimeWindow) -> String {
        let header = json!({
            "search_type": "query_then_fetch",
            "ignore_unavailable": true,
            "index": self.index,
        });
        format!("{header}\n{}\n", self.search_body(window))
    }
}

// Bucket aggregations form a single chain, each one the only bucket child of the previous.
// Value aggregations hang as sibling leaves under the deepest bucket.
pub fn build_plan(target: &Target, ds: &DatasourceRef, interval: Duration) -> Result<QueryPlan> {
    let time_field = target
        .str_field("timeField")
        .or_else(|| ds.json_str("timeField").filter(|f| !f.is_empty()))
        .unwrap_or(FALLBACK_TIME_FIELD)
        .to_string();
    let legacy_interval = es_version(ds).is_some_and(|v| v < (7, 2));
    let mut aggs = HashMap::new();

    let mut chain: Option<AggNode> = None;
    for raw in target.array_field("bucketAggs") {
        let Some(node) = bucket_node(raw, &time_field, interval, legacy_interval)? else {
            continue;
        };
        aggs.insert(
            node.name.clone(),
            AggInfo {
                field: node.field.clone(),
                kind: node.kind.clone(),
            },
        );
        match chain.as_mut() {
            Some(root) => root.deepest_mut().push_child(node)?,
            None => chain = Some(node),
        }
    }

    let mut leaves = Vec::new();
    for raw in target.array_field("metrics") {
        let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        if raw.get("hide").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let Some(op) = MetricOp::parse(kind) else {
            if kind != "count" {
                tracing::debug!(kind, "unsupported elasticsearch metric aggregation");
            }
            continue;
        };
        let name = agg_id(raw)?;
        let field = raw.get("field").and_then(Value::as_str).unwrap_or_default();
        if field.is_empty() {
            return Err(ScrapeError::Parse(format!(
                "elasticsearch {kind} aggregation {name} has no field"
            )));
        }
        let node = AggNode::new(name, AggKind::Metric(op), field);
        aggs.insert(
            node.name.clone(),
            AggInfo {
                field: node.field.clone(),
                kind: node.kind.clone(),
            },
        );
        leaves.push(node);
    }

    let roots = match chain {
        Some(mut root) => {
            let deepest = root.deepest_mut();
            for leaf in leaves {
                deepest.push_child(leaf)?;
            }
            vec![root]
        }
        None => leaves,
    };

    let query = target
        .str_field("query")
        .filter(|q| !q.trim().is_empty())
        .unwrap_or("*")
        .to_string();
    let index = ds
        .json_str("index")
        .map(str::to_string)
        .unwrap_or_else(|| ds.database.clone());

    Ok(QueryPlan {
        roots,
        aggs,
        time_field,
        query,
        index,
    })
}

// `jsonData.esVersion` is either a semver string ("7.10.0") or the older numeric form
// (56, 70) where the last digit is the minor version.
fn es_version(ds: &DatasourceRef) -> Option<(u64, u64)> {
    match ds.json_data.get("esVersion")? {
        Value::Number(n) => {
            let n = n.as_u64()?;
            Some(if n >= 10 { (n / 10, n % 10) } else { (n, 0) })
        }
        Value::String(s) => {
            let mut parts = s.trim().split('.');
            let major = parts.next()?.parse().ok()?;
            let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            Some((major, minor))
        }
        _ => None,
    }
}

// Calendar units have no fixed length and must go through `calendar_interval`.
fn is_calendar_interval(interval: &str) -> bool {
    matches!(interval, "1w" | "1M" | "1q" | "1y" | "week" | "month" | "quarter" | "year")
}

fn bucket_node(
    raw: &Value,
    time_field: &str,
    interval: Duration,
    legacy_interval: bool,
) -> Result<Option<AggNode>> {
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    let settings = raw.get("settings").cloned().unwrap_or(Value::Null);
    let field = raw
        .get("field")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
        .unwrap_or(time_field);

    let kind = match kind {
        "date_histogram" => {
            let requested = setting_str(&settings, "interval").unwrap_or("auto");
            let interval = if AUTO_INTERVALS.contains(&requested) {
                format!("{}s", interval_secs(interval))
            } else {
                requested.to_string()
            };
            AggKind::DateHistogram {
                interval,
                legacy_interval,
            }
        }
        "terms" => {
            let size = setting_u64(&settings, "size")
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_TERMS_SIZE);
            let order_by = match setting_str(&settings, "orderBy") {
                Some("_term") | Some("_key") => TermsOrder::Key,
                _ => TermsOrder::Count,
            };
            let descending = setting_str(&settings, "order") != Some("asc");
            let min_doc_count = setting_u64(&settings, "min_doc_count").unwrap_or(1);
            AggKind::Terms {
                size,
                order_by,
                descending,
                min_doc_count,
            }
        }
        other => {
            tracing::debug!(kind = other, "unsupported elasticsearch bucket aggregation");
            return Ok(None);
        }
    };

    Ok(Some(AggNode::new(agg_id(raw)?, kind, field)))
}

fn agg_id(raw: &Value) -> Result<String> {
    raw.get("id")
        .and_then(crate::decode::tag_value)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ScrapeError::Parse(format!("elasticsearch aggregation without id: {raw}")))
}

fn setting_str<'a>(settings: &'a Value, key: &str) -> Option<&'a str> {
    settings.get(key).and_then(Value::as_str)
}

// Grafana stores numeric settings as strings as often as numbers.
fn setting_u64(settings: &Value, key: &str) -> Option<u64> {
    match settings.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;

    fn window() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2021, 5, 3, 0, 0, 0).unwrap();
        TimeWindow {
            start,
            end: start + TimeDelta::minutes(5),
        }
    }

    fn target(body: Value) -> Target {
        serde_json::from_value(body).unwrap()
    }

    fn es_source() -> DatasourceRef {
        serde_json::from_value(json!({
            "id": 3, "type": "elasticsearch", "database": "logs-*",
            "jsonData": {"timeField": "@timestamp"}
        }))
        .unwrap()
    }

    fn bucket_depth(aggs: &Value) -> (usize, Vec<String>) {
        let Some(map) = aggs.as_object() else {
            return (0, Vec::new());
        };
        for node in map.values() {
            if node.get("terms").is_some() || node.get("date_histogram").is_some() {
                let (depth, leaves) = node
                    .get("aggs")
                    .map(bucket_depth)
                    .unwrap_or((0, Vec::new()));
                return (depth + 1, leaves);
            }
        }
        (0, map.keys().cloned().collect())
    }

    #[test]
    fn chain_depth_and_leaf_placement() {
        for n in 1..=4usize {
            for m in 0..=3usize {
                let mut bucket_aggs = Vec::new();
                for i in 0..n {
                    let kind = if i == n - 1 { "date_histogram" } else { "terms" };
                    bucket_aggs.push(json!({"id": format!("b{i}"), "type": kind, "field": format!("f{i}")}));
                }
                let ops = ["avg", "min", "max"];
                let metrics: Vec<Value> = (0..m)
                    .map(|j| json!({"id": format!("m{j}"), "type": ops[j], "field": "v"}))
                    .collect();
                let t = target(json!({"refId": "A", "bucketAggs": bucket_aggs, "metrics": metrics}));

                let plan = build_plan(&t, &es_source(), Duration::from_secs(60)).unwrap();
                let body = plan.search_body(&window());
                let (depth, mut leaves) = bucket_depth(&body["aggs"]);
                leaves.sort();
                let expected: Vec<String> = (0..m).map(|j| format!("m{j}")).collect();
                assert_eq!(depth, n, "n={n} m={m}");
                assert_eq!(leaves, expected, "n={n} m={m}");
            }
        }
    }

    #[test]
    fn field_precedence_and_auto_interval() {
        let t = target(json!({
            "refId": "A",
            "bucketAggs": [
                {"id": "2", "type": "terms", "field": "host", "settings": {"size": "10", "orderBy": "_term", "order": "asc"}},
                {"id": "3", "type": "date_histogram", "field": "", "settings": {"interval": "auto"}}
            ],
            "metrics": [{"id": "1", "type": "count"}]
        }));
        let plan = build_plan(&t, &es_source(), Duration::from_secs(30)).unwrap();
        let body = plan.search_body(&window());

        let terms = &body["aggs"]["2"]["terms"];
        assert_eq!(terms["field"], "host");
        assert_eq!(terms["size"], 10);
        assert_eq!(terms["order"]["_key"], "asc");

        let hist = &body["aggs"]["2"]["aggs"]["3"]["date_histogram"];
        assert_eq!(hist["field"], "@timestamp");
        assert_eq!(hist["fixed_interval"], "30s");
        assert!(hist.get("interval").is_none());
        assert_eq!(hist["format"], "epoch_millis");
        assert!(body["aggs"]["2"]["aggs"]["3"].get("aggs").is_none());

        assert_eq!(plan.lookup("2").unwrap().field, "host");
        assert!(plan.lookup("1").is_none());
    }

    #[test]
    fn explicit_interval_and_literal_time_field() {
        let t = target(json!({
            "refId": "A",
            "timeField": "",
            "bucketAggs": [{"id": "2", "type": "date_histogram", "settings": {"interval": "10m"}}]
        }));
        let ds = DatasourceRef::default();
        let plan = build_plan(&t, &ds, Duration::from_secs(30)).unwrap();
        let body = plan.search_body(&window());
        assert_eq!(body["aggs"]["2"]["date_histogram"]["fixed_interval"], "10m");
        assert_eq!(body["aggs"]["2"]["date_histogram"]["field"], "timestamp");
        assert!(body["query"]["bool"]["filter"][0]["range"]["timestamp"].is_object());
    }

    #[test]
    fn interval_key_follows_cluster_version() {
        let t = target(json!({
            "refId": "A",
            "bucketAggs": [{"id": "2", "type": "date_histogram", "settings": {"interval": "1m"}}]
        }));
        let hist = |version: Value| {
            let mut ds = es_source();
            ds.json_data.insert("esVersion".into(), version);
            let plan = build_plan(&t, &ds, Duration::from_secs(30)).unwrap();
            plan.search_body(&window())["aggs"]["2"]["date_histogram"].clone()
        };

        assert_eq!(hist(json!(56))["interval"], "1m");
        assert_eq!(hist(json!("7.1.1"))["interval"], "1m");
        assert_eq!(hist(json!(70))["interval"], "1m");
        assert_eq!(hist(json!("7.10.0"))["fixed_interval"], "1m");
        assert_eq!(hist(json!("8.11.0"))["fixed_interval"], "1m");
        assert!(hist(json!("8.11.0")).get("interval").is_none());
    }

    #[test]
    fn calendar_units_use_calendar_interval() {
        let t = target(json!({
            "refId": "A",
            "bucketAggs": [{"id": "2", "type": "date_histogram", "settings": {"interval": "1M"}}]
        }));
        let plan = build_plan(&t, &es_source(), Duration::from_secs(30)).unwrap();
        let hist = &plan.search_body(&window())["aggs"]["2"]["date_histogram"];
        assert_eq!(hist["calendar_interval"], "1M");
        assert!(hist.get("fixed_interval").is_none());
    }

    #[test]
    fn range_and_query_string_filters() {
        let t = target(json!({"refId": "A", "query": "", "bucketAggs": []}));
        let plan = build_plan(&t, &es_source(), Duration::from_secs(60)).unwrap();
        let body = plan.search_body(&window());
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0]["range"]["@timestamp"]["gte"], 1_620_000_000_000i64);
        assert_eq!(filters[0]["range"]["@timestamp"]["lte"], 1_620_000_300_000i64);
        assert_eq!(filters[1]["query_string"]["query"], "*");

        let payload = plan.msearch_payload(&window());
        let mut lines = payload.lines();
        let header: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header["index"], "logs-*");
        assert!(payload.ends_with('\n'));
    }

    #[test]
    fn metric_nodes_reject_children() {
        let mut leaf = AggNode::new("1", AggKind::Metric(MetricOp::Sum), "bytes");
        let child = AggNode::new("2", AggKind::Metric(MetricOp::Avg), "bytes");
        assert!(leaf.push_child(child).is_err());
        assert!(leaf.children().is_empty());
    }

    #[test]
    fn metric_without_field_is_rejected() {
        let t = target(json!({
            "refId": "A",
            "bucketAggs": [{"id": "2", "type": "date_histogram"}],
            "metrics": [{"id": "1", "type": "avg"}]
        }));
        assert!(build_plan(&t, &es_source(), Duration::from_secs(60)).is_err());
    }
}
