use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::point::{Point, Tags};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::query::{AggKind, QueryPlan};
use crate::Push;
use crate::decode::{from_millis, number, tag_value};

const METRIC_TAG: &str = "metric";

#[derive(Debug, Deserialize)]
pub struct MultiSearchResponse {
    #[serde(default)]
    pub responses: Vec<SearchResponse>,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub aggregations: Option<Map<String, Value>>,
}

impl SearchResponse {
    pub fn check(&self) -> Result<()> {
        let Some(error) = &self.error else {
            return Ok(());
        };
        let reason = error
            .get("reason")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        Err(ScrapeError::Backend(format!("elasticsearch: {reason}")))
    }
}

pub fn decode_response(
    resp: MultiSearchResponse,
    plan: &QueryPlan,
    tags: Tags,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    let Some(first) = resp.responses.into_iter().next() else {
        return Ok(0);
    };
    first.check()?;
    match &first.aggregations {
        Some(aggs) => Ok(walk(aggs, plan, tags, collected_at, push)),
        None => Ok(0),
    }
}

// Each step owns its tag set, so a bucket only ever sees the keys of its own ancestors.
pub fn walk(
    aggs: &Map<String, Value>,
    plan: &QueryPlan,
    tags: Tags,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> usize {
    let mut pushed = 0;
    for (name, node) in aggs {
        let Some(info) = plan.lookup(name) else {
            continue;
        };
        if !info.kind.is_bucket() {
            continue;
        }
        let Some(buckets) = node.get("buckets").and_then(Value::as_array) else {
            continue;
        };
        let is_histogram = matches!(info.kind, AggKind::DateHistogram { .. });

        for bucket in buckets {
            let Some(bucket) = bucket.as_object() else {
                continue;
            };
            if is_histogram {
                if let Some(ts) = time_bucket(bucket) {
                    pushed += emit_bucket(bucket, plan, &tags, ts, collected_at, push);
                    continue;
                }
            }
            match bucket.get("key").and_then(tag_value) {
                Some(key) if !is_histogram => {
                    let mut child_tags = tags.clone();
                    child_tags.insert(info.field.clone(), key);
                    pushed += walk(bucket, plan, child_tags, collected_at, push);
                }
                _ => {
                    tracing::debug!(agg = %name, "elasticsearch bucket without usable key");
                }
            }
        }
    }
    pushed
}

// A bucket is a time bucket when its numeric key printed back matches key_as_string.
fn time_bucket(bucket: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let Value::Number(key) = bucket.get("key")? else {
        return None;
    };
    let as_string = bucket.get("key_as_string")?.as_str()?;
    if key.to_string() != as_string {
        return None;
    }
    from_millis(key.as_i64()?)
}

fn emit_bucket(
    bucket: &Map<String, Value>,
    plan: &QueryPlan,
    tags: &Tags,
    ts: DateTime<Utc>,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> usize {
    let mut pushed = 0;
    if let Some(count) = bucket.get("doc_count").and_then(number) {
        push(Point::new(collected_at, tags.clone(), ts, count));
        pushed += 1;
    }

    for (name, leaf) in bucket {
        let Some(info) = plan.lookup(name) else {
            continue;
        };
        let AggKind::Metric(op) = &info.kind else {
            continue;
        };
        let Some(value) = leaf.get("value").and_then(number) else {
            continue;
        };
        let mut leaf_tags = tags.clone();
        leaf_tags.insert(
            METRIC_TAG.to_string(),
            format!("{}_{}", op.as_str(), info.field),
        );
        push(Point::new(collected_at, leaf_tags, ts, value));
        pushed += 1;
    }
    pushed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use grafscrape_core::model::dashboard::Target;
    use grafscrape_core::model::datasource::DatasourceRef;
    use serde_json::json;

    use super::*;
    use crate::elasticsearch::query::build_plan;

    fn plan(body: Value) -> QueryPlan {
        let target: Target = serde_json::from_value(body).unwrap();
        build_plan(&target, &DatasourceRef::default(), Duration::from_secs(60)).unwrap()
    }

    fn collect(aggs: Value, plan: &QueryPlan, tags: Tags) -> Vec<Point> {
        let mut points = Vec::new();
        let aggs = aggs.as_object().unwrap().clone();
        let pushed = walk(&aggs, plan, tags, Utc::now(), &mut |p| points.push(p));
        assert_eq!(pushed, points.len());
        points
    }

    #[test]
    fn single_time_bucket() {
        let plan = plan(json!({
            "refId": "A",
            "bucketAggs": [{"id": "t", "type": "date_histogram"}]
        }));
        let points = collect(
            json!({"t": {"buckets": [
                {"key": 1620000000000u64, "key_as_string": "1620000000000", "doc_count": 42}
            ]}}),
            &plan,
            Tags::new(),
        );
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].ts.timestamp_millis(), 1_620_000_000_000);
        assert_eq!(points[0].value, 42.0);
        assert!(points[0].tags.is_empty());
    }

    #[test]
    fn sibling_terms_do_not_share_tags() {
        let plan = plan(json!({
            "refId": "A",
            "bucketAggs": [
                {"id": "2", "type": "terms", "field": "host"},
                {"id": "3", "type": "terms", "field": "status"},
                {"id": "4", "type": "date_histogram"}
            ]
        }));
        let histogram = |count: u64| {
            json!({"4": {"buckets": [
                {"key": 1620000000000u64, "key_as_string": "1620000000000", "doc_count": count}
            ]}})
        };
        let mut only_a = histogram(1).as_object().unwrap().clone();
        only_a.insert("key".into(), json!("ok"));
        let mut only_b = histogram(2).as_object().unwrap().clone();
        only_b.insert("key".into(), json!(500));

        let points = collect(
            json!({"2": {"buckets": [
                {"key": "web-1", "doc_count": 3, "3": {"buckets": [Value::Object(only_a)]}},
                {"key": "web-2", "doc_count": 2, "3": {"buckets": [Value::Object(only_b)]}}
            ]}}),
            &plan,
            Tags::new(),
        );

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].tags["host"], "web-1");
        assert_eq!(points[0].tags["status"], "ok");
        assert_eq!(points[1].tags["host"], "web-2");
        assert_eq!(points[1].tags["status"], "500");
        assert_eq!(points[1].value, 2.0);
    }

    #[test]
    fn numeric_terms_keys_become_tags() {
        let plan = plan(json!({
            "refId": "A",
            "bucketAggs": [
                {"id": "2", "type": "terms", "field": "code"},
                {"id": "3", "type": "date_histogram"}
            ]
        }));
        let points = collect(
            json!({"2": {"buckets": [{"key": 503, "doc_count": 4, "3": {"buckets": [
                {"key": 1620000000000u64, "key_as_string": "1620000000000", "doc_count": 4}
            ]}}]}}),
            &plan,
            Tags::new(),
        );
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].tags["code"], "503");
        assert_eq!(points[0].value, 4.0);
    }

    #[test]
    fn terms_key_never_counts_as_time() {
        let plan = plan(json!({
            "refId": "A",
            "bucketAggs": [{"id": "2", "type": "terms", "field": "code"}]
        }));
        let points = collect(
            json!({"2": {"buckets": [{"key": 200, "key_as_string": "200", "doc_count": 9}]}}),
            &plan,
            Tags::new(),
        );
        assert!(points.is_empty());
    }

    #[test]
    fn metric_leaves_add_points() {
        let plan = plan(json!({
            "refId": "A",
            "bucketAggs": [{"id": "2", "type": "date_histogram"}],
            "metrics": [
                {"id": "5", "type": "avg", "field": "latency"},
                {"id": "6", "type": "max", "field": "latency"}
            ]
        }));
        let mut alias = Tags::new();
        alias.insert("alias".into(), "api".into());
        let points = collect(
            json!({"2": {"buckets": [{
                "key": 1620000000000u64, "key_as_string": "1620000000000", "doc_count": 4,
                "5": {"value": 0.5}, "6": {"value": null}, "unrelated": {"value": 1}
            }]}}),
            &plan,
            alias,
        );

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 4.0);
        assert!(!points[0].tags.contains_key("metric"));
        assert_eq!(points[1].tags["metric"], "avg_latency");
        assert_eq!(points[1].tags["alias"], "api");
        assert_eq!(points[1].value, 0.5);
    }

    #[test]
    fn unknown_aggregations_are_ignored() {
        let plan = plan(json!({"refId": "A", "bucketAggs": []}));
        let points = collect(
            json!({"9": {"buckets": [{"key": "x", "doc_count": 1}]}}),
            &plan,
            Tags::new(),
        );
        assert!(points.is_empty());
    }

    #[test]
    fn backend_error_surfaces() {
        let resp: MultiSearchResponse = serde_json::from_value(json!({
            "responses": [{"error": {"type": "index_not_found_exception", "reason": "no such index [x]"}}]
        }))
        .unwrap();
        let plan = plan(json!({"refId": "A"}));
        let err =
            decode_response(resp, &plan, Tags::new(), Utc::now(), &mut |_: Point| {}).unwrap_err();
        assert!(matches!(err, ScrapeError::Backend(msg) if msg.contains("no such index")));
    }
}
