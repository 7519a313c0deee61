use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::point::{Point, Tags};
use serde::Deserialize;
use serde_json::Value;

use crate::decode::{interval_secs, number, timestamp};
use crate::{Datasource, FetchRequest, Push, Transport};

const DATA_PATH: &str = "api/v1/data";

pub struct Netdata;

#[derive(Debug, Deserialize)]
pub struct DataResponse {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
}

impl Datasource for Netdata {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let Some(chart) = req
            .target
            .str_field("chart")
            .or_else(|| req.target.str_field("context"))
        else {
            tracing::debug!(ref_id = %req.target.ref_id, "netdata target has no chart");
            return Ok(());
        };

        let window = req.period.resolve();
        let step = interval_secs(req.interval) as i64;
        let points = ((window.end_secs() - window.start_secs()) / step).max(1);
        let mut params = vec![
            ("chart", chart.to_string()),
            ("after", window.start_secs().to_string()),
            ("before", window.end_secs().to_string()),
            ("points", points.to_string()),
            ("group", "average".to_string()),
            ("format", "json".to_string()),
            ("options", "seconds|flip".to_string()),
        ];
        let dimensions: Vec<&str> = req
            .target
            .array_field("dimensions")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        if !dimensions.is_empty() {
            params.push(("dimensions", dimensions.join(",")));
        }

        let resp: DataResponse = transport.query(req.datasource, DATA_PATH, &params).await?;
        decode_response(resp, chart, Utc::now(), push)?;
        Ok(())
    }
}

pub fn decode_response(
    resp: DataResponse,
    chart: &str,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    if resp.data.is_empty() {
        return Ok(0);
    }
    match resp.labels.first().map(String::as_str) {
        Some("time") => {}
        other => {
            return Err(ScrapeError::Decode(format!(
                "netdata response must lead with a time label, got {other:?}"
            )));
        }
    }

    let mut pushed = 0;
    for row in &resp.data {
        let Some(ts) = row.first().and_then(timestamp) else {
            continue;
        };
        for (dimension, raw) in resp.labels.iter().zip(row.iter()).skip(1) {
            let Some(value) = number(raw) else {
                continue;
            };
            let mut tags = Tags::new();
            tags.insert("chart".to_string(), chart.to_string());
            tags.insert("dimension".to_string(), dimension.clone());
            push(Point::new(collected_at, tags, ts, value));
            pushed += 1;
        }
    }
    Ok(pushed)
}
