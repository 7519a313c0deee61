use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::Target;
use grafscrape_core::model::datasource::HttpMethod;
use grafscrape_core::model::point::{Point, Tags};
use grafscrape_core::time::TimeWindow;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::decode::{interval_secs, number, tag_value, timestamp};
use crate::{Datasource, FetchRequest, Push, Transport};

const DEFAULT_TIME_COLUMN: &str = "timestamp";
const COLUMN_TAG: &str = "column";
const MACRO_PATTERN: &str = r"\$(\w+)";

pub struct ClickHouse;

#[derive(Debug, Deserialize)]
pub struct ClickHouseResponse {
    #[serde(default)]
    pub meta: Vec<Column>,
    #[serde(default)]
    pub data: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Column {
    fn is_numeric(&self) -> bool {
        let kind = unwrap_type(&self.kind);
        kind.starts_with("Int")
            || kind.starts_with("UInt")
            || kind.starts_with("Float")
            || kind.starts_with("Decimal")
    }
}

fn unwrap_type(kind: &str) -> &str {
    let mut kind = kind;
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(inner) = kind.strip_prefix(wrapper) {
            kind = inner.strip_suffix(')').unwrap_or(inner);
        }
    }
    kind
}

impl Datasource for ClickHouse {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let Some(query) = req.target.str_field("query") else {
            tracing::debug!(ref_id = %req.target.ref_id, "clickhouse target has no query");
            return Ok(());
        };
        let window = req.period.resolve();
        let sql = with_json_format(&expand_macros(
            query,
            req.target,
            &window,
            interval_secs(req.interval),
        )?);

        // ClickHouse reads a POSTed query from the raw body, never from a form.
        let resp: ClickHouseResponse = match req.datasource.http_method() {
            HttpMethod::Get => transport.query(req.datasource, "", &[("query", sql)]).await?,
            HttpMethod::Post => {
                transport
                    .post_text(req.datasource, "", "text/plain; charset=utf-8", sql)
                    .await?
            }
        };
        decode_response(resp, Utc::now(), push)?;
        Ok(())
    }
}

// Macros are matched as whole `$identifier` tokens, so `$fromTime` or
// `$timeFilterByColumn(..)` are left for ClickHouse to reject rather than half-expanded.
pub fn expand_macros(
    query: &str,
    target: &Target,
    window: &TimeWindow,
    interval: u64,
) -> Result<String> {
    let time_col = target
        .str_field("dateTimeColDataType")
        .unwrap_or(DEFAULT_TIME_COLUMN);
    let from = format!("toDateTime('{}')", window.start_text());
    let to = format!("toDateTime('{}')", window.end_text());
    let table = match (target.str_field("database"), target.str_field("table")) {
        (Some(db), Some(table)) => format!("{db}.{table}"),
        (None, Some(table)) => table.to_string(),
        _ => String::new(),
    };
    let time_filter = format!("{time_col} >= {from} AND {time_col} <= {to}");
    let time_series = format!("(intDiv(toUInt32({time_col}), {interval}) * {interval}) * 1000");
    let interval = interval.to_string();

    let pattern = Regex::new(MACRO_PATTERN)
        .map_err(|e| ScrapeError::Internal(format!("bad macro pattern: {e}")))?;
    let expanded = pattern.replace_all(query, |caps: &Captures<'_>| {
        let replacement = match &caps[1] {
            "timeFilter" => &time_filter,
            "timeSeries" => &time_series,
            "table" => &table,
            "from" => &from,
            "to" => &to,
            "interval" => &interval,
            _ => return caps[0].to_string(),
        };
        replacement.clone()
    });
    Ok(expanded.into_owned())
}

pub fn with_json_format(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.to_ascii_uppercase().contains(" FORMAT ") {
        trimmed.to_string()
    } else {
        format!("{trimmed} FORMAT JSON")
    }
}

// First column is time, remaining numeric columns are values and anything else is a tag.
pub fn decode_response(
    resp: ClickHouseResponse,
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    let Some((time_col, rest)) = resp.meta.split_first() else {
        return Ok(0);
    };
    let (values, tags): (Vec<&Column>, Vec<&Column>) = rest.iter().partition(|c| c.is_numeric());
    if values.is_empty() && !resp.data.is_empty() {
        return Err(ScrapeError::Decode(
            "clickhouse result has no numeric columns".to_string(),
        ));
    }
    let tag_columns = values.len() > 1;

    let mut pushed = 0;
    for row in &resp.data {
        let Some(ts) = row.get(&time_col.name).and_then(timestamp) else {
            continue;
        };
        let mut row_tags = Tags::new();
        for col in &tags {
            if let Some(v) = row.get(&col.name).and_then(tag_value) {
                row_tags.insert(col.name.clone(), v);
            }
        }
        for col in &values {
            let Some(value) = row.get(&col.name).and_then(number) else {
                continue;
            };
            let mut point_tags = row_tags.clone();
            if tag_columns {
                point_tags.insert(COLUMN_TAG.to_string(), col.name.clone());
            }
            push(Point::new(collected_at, point_tags, ts, value));
            pushed += 1;
        }
    }
    Ok(pushed)
}
