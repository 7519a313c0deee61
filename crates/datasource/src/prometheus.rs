use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::point::{Point, Tags};
use serde::Deserialize;
use serde_json::Value;

use crate::decode::{from_secs_f64, interval_secs, number};
use crate::{Datasource, FetchRequest, Push, Transport};

const QUERY_RANGE_PATH: &str = "api/v1/query_range";

pub struct Prometheus;

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(rename = "errorType", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: Tags,
    #[serde(default)]
    values: Vec<(f64, Value)>,
    #[serde(default)]
    value: Option<(f64, Value)>,
}

impl Datasource for Prometheus {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let Some(expr) = req.target.str_field("expr") else {
            tracing::debug!(ref_id = %req.target.ref_id, "prometheus target has no expression");
            return Ok(());
        };

        let window = req.period.resolve();
        let params = [
            ("query", expr.to_string()),
            ("start", window.start_secs().to_string()),
            ("end", window.end_secs().to_string()),
            ("step", interval_secs(req.interval).to_string()),
        ];
        let resp: QueryResponse = transport
            .query(req.datasource, QUERY_RANGE_PATH, &params)
            .await?;
        decode_response(resp, Utc::now(), push)?;
        Ok(())
    }
}

pub fn decode_response(
    resp: QueryResponse,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    if resp.status != "success" {
        return Err(ScrapeError::Backend(format!(
            "prometheus query failed ({}): {}",
            resp.error_type.unwrap_or_else(|| resp.status.clone()),
            resp.error.unwrap_or_default()
        )));
    }
    let Some(data) = resp.data else {
        return Ok(0);
    };

    let mut pushed = 0;
    match data.result {
        Value::Array(items) if data.result_type != "scalar" && data.result_type != "string" => {
            for item in items {
                let series: Series = serde_json::from_value(item)
                    .map_err(|e| ScrapeError::Decode(format!("bad prometheus series: {e}")))?;
                let samples = series.values.iter().chain(series.value.iter());
                for (ts, raw) in samples {
                    if let Some(point) = sample(collected_at, &series.metric, *ts, raw) {
                        push(point);
                        pushed += 1;
                    }
                }
            }
        }
        Value::Array(pair) if pair.len() == 2 => {
            let ts = pair[0].as_f64().unwrap_or_default();
            if let Some(point) = sample(collected_at, &Tags::new(), ts, &pair[1]) {
                push(point);
                pushed += 1;
            }
        }
        Value::Null => {}
        other => {
            return Err(ScrapeError::Decode(format!(
                "unexpected prometheus result for type {}: {other}",
                data.result_type
            )));
        }
    }
    Ok(pushed)
}

fn sample(collected_at: DateTime<Utc>, labels: &Tags, ts: f64, raw: &Value) -> Option<Point> {
    let ts = from_secs_f64(ts)?;
    let value = number(raw)?;
    Some(Point::new(collected_at, labels.clone(), ts, value))
}
