use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::Target;
use grafscrape_core::model::point::{Point, Tags};
use grafscrape_core::time::TimeWindow;
use serde::Deserialize;
use serde_json::Value;

use crate::decode::{from_millis, interval_secs, number, timestamp};
use crate::{Datasource, FetchRequest, Push, Transport};

const QUERY_PATH: &str = "query";
const COLUMN_TAG: &str = "column";

pub struct InfluxDb;

#[derive(Debug, Deserialize)]
pub struct InfluxResponse {
    #[serde(default)]
    pub results: Vec<InfluxResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InfluxResult {
    #[serde(default)]
    pub series: Vec<InfluxSeries>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InfluxSeries {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl Datasource for InfluxDb {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let Some(query) = build_query(req.target) else {
            tracing::debug!(ref_id = %req.target.ref_id, "influxdb target has no query");
            return Ok(());
        };
        let window = req.period.resolve();
        let query = expand_macros(&query, &window, interval_secs(req.interval));

        let db = if req.datasource.database.is_empty() {
            req.datasource.json_str("dbName").unwrap_or_default()
        } else {
            req.datasource.database.as_str()
        };
        let params = [
            ("db", db.to_string()),
            ("q", query),
            ("epoch", "ms".to_string()),
        ];
        let resp: InfluxResponse = transport.query(req.datasource, QUERY_PATH, &params).await?;
        decode_response(resp, Utc::now(), push)?;
        Ok(())
    }
}

// Raw targets carry InfluxQL directly; editor targets are assembled from their parts.
pub fn build_query(target: &Target) -> Option<String> {
    let raw = target
        .field("rawQuery")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if raw || target.field("measurement").is_none() {
        return target.str_field("query").map(str::to_string);
    }

    let measurement = target.str_field("measurement")?;
    let selects: Vec<String> = target
        .array_field("select")
        .iter()
        .filter_map(|parts| render_select(parts.as_array()?))
        .collect();
    let selects = if selects.is_empty() {
        vec!["mean(\"value\")".to_string()]
    } else {
        selects
    };

    let mut query = format!("SELECT {} FROM ", selects.join(", "));
    if let Some(policy) = target.str_field("policy").filter(|p| *p != "default") {
        query.push_str(&format!("\"{policy}\"."));
    }
    query.push_str(&format!("\"{measurement}\" WHERE "));

    let conditions = render_conditions(target.array_field("tags"));
    if !conditions.is_empty() {
        query.push_str(&format!("({conditions}) AND "));
    }
    query.push_str("$timeFilter");

    let mut group_by = Vec::new();
    let mut fill = None;
    for part in target.array_field("groupBy") {
        let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
        let param = first_param(part).unwrap_or_default();
        match kind {
            "time" => group_by.push(format!("time({param})")),
            "tag" => group_by.push(format!("\"{param}\"")),
            "fill" => fill = Some(format!(" fill({param})")),
            _ => {}
        }
    }
    if !group_by.is_empty() {
        query.push_str(&format!(" GROUP BY {}", group_by.join(", ")));
    }
    if let Some(fill) = fill {
        query.push_str(&fill);
    }
    Some(query)
}

fn render_select(parts: &[Value]) -> Option<String> {
    let mut expr = String::new();
    let mut alias = None;
    for part in parts {
        let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
        let param = first_param(part);
        match kind {
            "field" => expr = format!("\"{}\"", param?),
            "alias" => alias = param,
            "math" => expr.push_str(&format!(" {}", param?)),
            "" => {}
            func => {
                let extra = part
                    .get("params")
                    .and_then(Value::as_array)
                    .map(|ps| {
                        ps.iter()
                            .filter_map(crate::decode::tag_value)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                expr = if extra.is_empty() {
                    format!("{func}({expr})")
                } else {
                    format!("{func}({expr}, {})", extra.join(", "))
                };
            }
        }
    }
    if expr.is_empty() {
        return None;
    }
    Some(match alias {
        Some(alias) => format!("{expr} AS \"{alias}\""),
        None => expr,
    })
}

fn render_conditions(tags: &[Value]) -> String {
    let mut out = String::new();
    for (i, tag) in tags.iter().enumerate() {
        let key = tag.get("key").and_then(Value::as_str).unwrap_or_default();
        let op = tag.get("operator").and_then(Value::as_str).unwrap_or("=");
        let value = tag.get("value").and_then(Value::as_str).unwrap_or_default();
        if i > 0 {
            let cond = tag
                .get("condition")
                .and_then(Value::as_str)
                .unwrap_or("AND");
            out.push_str(&format!(" {cond} "));
        }
        let rendered = if op == "=~" || op == "!~" {
            value.to_string()
        } else {
            format!("'{}'", value.replace('\'', "\\'"))
        };
        out.push_str(&format!("\"{key}\" {op} {rendered}"));
    }
    out
}

fn first_param(part: &Value) -> Option<String> {
    part.get("params")?
        .as_array()?
        .first()
        .and_then(crate::decode::tag_value)
}

pub fn expand_macros(query: &str, window: &TimeWindow, interval_secs: u64) -> String {
    let time_filter = format!(
        "time >= {}ms and time <= {}ms",
        window.start_millis(),
        window.end_millis()
    );
    query
        .replace("$timeFilter", &time_filter)
        .replace("$__interval_ms", &(interval_secs * 1000).to_string())
        .replace("$__interval", &format!("{interval_secs}s"))
        .replace("$interval", &format!("{interval_secs}s"))
}

// Queries ask for `epoch=ms`, so numeric times are always milliseconds.
fn epoch_ms(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(ms) => from_millis(ms),
            None => from_millis(n.as_f64()? as i64),
        },
        other => timestamp(other),
    }
}

pub fn decode_response(
    resp: InfluxResponse,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    if let Some(err) = resp.error {
        return Err(ScrapeError::Backend(format!("influxdb query failed: {err}")));
    }

    let mut pushed = 0;
    for result in resp.results {
        if let Some(err) = result.error {
            return Err(ScrapeError::Backend(format!("influxdb query failed: {err}")));
        }
        for series in result.series {
            let Some(time_idx) = series.columns.iter().position(|c| c == "time") else {
                tracing::debug!(series = %series.name, "influxdb series without time column");
                continue;
            };
            let value_columns: Vec<(usize, &String)> = series
                .columns
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != time_idx)
                .collect();
            let tag_columns = value_columns.len() > 1;

            for row in &series.values {
                let Some(ts) = row.get(time_idx).and_then(epoch_ms) else {
                    continue;
                };
                for (idx, column) in &value_columns {
                    let Some(value) = row.get(*idx).and_then(number) else {
                        continue;
                    };
                    let mut tags = series.tags.clone();
                    if tag_columns {
                        tags.insert(COLUMN_TAG.to_string(), (*column).clone());
                    }
                    push(Point::new(collected_at, tags, ts, value));
                    pushed += 1;
                }
            }
        }
    }
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;

    use super::*;

    fn target(body: Value) -> Target {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn raw_query_passes_through() {
        let t = target(json!({"refId": "A", "rawQuery": true, "query": "SELECT 1"}));
        assert_eq!(build_query(&t).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn builds_editor_query() {
        let t = target(json!({
            "refId": "A",
            "measurement": "cpu",
            "policy": "default",
            "select": [[
                {"type": "field", "params": ["usage_idle"]},
                {"type": "mean", "params": []},
                {"type": "math", "params": ["* -1"]},
                {"type": "alias", "params": ["idle"]}
            ]],
            "tags": [
                {"key": "host", "operator": "=", "value": "web-1"},
                {"key": "dc", "operator": "=~", "value": "/eu-.*/", "condition": "OR"}
            ],
            "groupBy": [
                {"type": "time", "params": ["$__interval"]},
                {"type": "tag", "params": ["host"]},
                {"type": "fill", "params": ["null"]}
            ]
        }));
        assert_eq!(
            build_query(&t).unwrap(),
            "SELECT mean(\"usage_idle\") * -1 AS \"idle\" FROM \"cpu\" WHERE \
             (\"host\" = 'web-1' OR \"dc\" =~ /eu-.*/) AND $timeFilter \
             GROUP BY time($__interval), \"host\" fill(null)"
        );
    }

    #[test]
    fn expands_time_macros() {
        let start = Utc.with_ymd_and_hms(2021, 5, 3, 0, 0, 0).unwrap();
        let window = TimeWindow {
            start,
            end: start + TimeDelta::minutes(5),
        };
        let q = expand_macros(
            "SELECT mean(v) FROM m WHERE $timeFilter GROUP BY time($__interval)",
            &window,
            60,
        );
        assert_eq!(
            q,
            "SELECT mean(v) FROM m WHERE time >= 1620000000000ms and time <= 1620000300000ms \
             GROUP BY time(60s)"
        );
    }

    #[test]
    fn decodes_series_with_column_tags() {
        let resp: InfluxResponse = serde_json::from_value(json!({
            "results": [{
                "statement_id": 0,
                "series": [{
                    "name": "cpu",
                    "tags": {"host": "web-1"},
                    "columns": ["time", "mean", "max"],
                    "values": [[1620000000000u64, 1.5, 3], [1620000060000u64, null, 4]]
                }]
            }]
        }))
        .unwrap();

        let mut points = Vec::new();
        let pushed = decode_response(resp, Utc::now(), &mut |p| points.push(p)).unwrap();
        assert_eq!(pushed, 3);
        assert_eq!(points[0].tags["host"], "web-1");
        assert_eq!(points[0].tags["column"], "mean");
        assert_eq!(points[1].tags["column"], "max");
        assert_eq!(points[2].value, 4.0);
    }

    #[test]
    fn single_column_has_no_column_tag() {
        let resp: InfluxResponse = serde_json::from_value(json!({
            "results": [{"series": [{"name": "m", "columns": ["time", "v"], "values": [[1620000000000u64, 2]]}]}]
        }))
        .unwrap();
        let mut points = Vec::new();
        decode_response(resp, Utc::now(), &mut |p| points.push(p)).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].tags.is_empty());
    }

    #[test]
    fn small_times_are_milliseconds() {
        let resp: InfluxResponse = serde_json::from_value(json!({
            "results": [{"series": [{"name": "m", "columns": ["time", "v"], "values": [
                [86_400_000, 1], [0, 2], ["2021-05-03T00:00:00Z", 3]
            ]}]}]
        }))
        .unwrap();
        let mut points = Vec::new();
        decode_response(resp, Utc::now(), &mut |p| points.push(p)).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].ts, Utc.with_ymd_and_hms(1970, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(points[1].ts.timestamp_millis(), 0);
        assert_eq!(points[2].ts.timestamp(), 1_620_000_000);
    }

    #[test]
    fn statement_error_is_backend_error() {
        let resp: InfluxResponse =
            serde_json::from_value(json!({"results": [{"error": "database not found: x"}]}))
                .unwrap();
        let err = decode_response(resp, Utc::now(), &mut |_: Point| {}).unwrap_err();
        assert!(matches!(err, ScrapeError::Backend(_)));
    }
}
