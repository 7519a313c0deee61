use chrono::{DateTime, Utc};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::point::{Point, Tags};
use grafscrape_core::time::TimeWindow;
use serde_json::Value;

use crate::decode::{number, timestamp};
use crate::{Datasource, FetchRequest, Push, Transport};

const FIELD_TAG: &str = "field";

pub struct JsonApi;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldPath {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
    Wildcard,
}

impl Datasource for JsonApi {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let fields = field_paths(req.target.array_field("fields"));
        if fields.is_empty() {
            tracing::debug!(ref_id = %req.target.ref_id, "json target has no fields");
            return Ok(());
        }

        let window = req.period.resolve();
        let path = expand_macros(req.target.str_field("urlPath").unwrap_or_default(), &window);
        let params: Vec<(&str, String)> = req
            .target
            .array_field("params")
            .iter()
            .filter_map(|pair| {
                let pair = pair.as_array()?;
                let key = pair.first()?.as_str()?;
                let value = pair.get(1).and_then(Value::as_str).unwrap_or_default();
                Some((key, expand_macros(value, &window)))
            })
            .collect();

        let method = req.target.str_field("method").unwrap_or("GET");
        let body: Value = if method.eq_ignore_ascii_case("post") {
            let raw = expand_macros(req.target.str_field("body").unwrap_or("{}"), &window);
            let payload: Value = serde_json::from_str(&raw).map_err(|e| {
                ScrapeError::Parse(format!("json target body is not valid JSON: {e}"))
            })?;
            transport
                .post_json(req.datasource, &path, &params, &payload)
                .await?
        } else {
            transport.get(req.datasource, &path, &params).await?
        };

        decode_response(&body, &fields, Utc::now(), push)?;
        Ok(())
    }
}

pub fn field_paths(raw: &[Value]) -> Vec<FieldPath> {
    raw.iter()
        .filter_map(|field| {
            let path = field.get("jsonPath").and_then(Value::as_str)?;
            if path.is_empty() {
                return None;
            }
            let name = field
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .unwrap_or(path);
            Some(FieldPath {
                name: name.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

pub fn expand_macros(raw: &str, window: &TimeWindow) -> String {
    raw.replace("$__from", &window.start_millis().to_string())
        .replace("$__to", &window.end_millis().to_string())
}

// The first field holds timestamps; every following field is a value column aligned by index.
pub fn decode_response(
    body: &Value,
    fields: &[FieldPath],
    collected_at: DateTime<Utc>,
    push: &mut Push<'_>,
) -> Result<usize> {
    let Some((time_field, value_fields)) = fields.split_first() else {
        return Ok(0);
    };
    if value_fields.is_empty() {
        return Err(ScrapeError::Decode(
            "json target needs a time field followed by value fields".to_string(),
        ));
    }

    let times = select(body, &time_field.path)?;
    let mut pushed = 0;
    for field in value_fields {
        let values = select(body, &field.path)?;
        for (raw_ts, raw_value) in times.iter().zip(values.iter()) {
            let (Some(ts), Some(value)) = (timestamp(raw_ts), number(raw_value)) else {
                continue;
            };
            let mut tags = Tags::new();
            tags.insert(FIELD_TAG.to_string(), field.name.clone());
            push(Point::new(collected_at, tags, ts, value));
            pushed += 1;
        }
    }
    Ok(pushed)
}

pub fn select<'a>(root: &'a Value, path: &str) -> Result<Vec<&'a Value>> {
    let mut current = vec![root];
    for step in parse_path(path)? {
        let mut next = Vec::new();
        for node in current {
            match (&step, node) {
                (Step::Key(key), Value::Object(map)) => next.extend(map.get(key)),
                (Step::Index(i), Value::Array(items)) => next.extend(items.get(*i)),
                (Step::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                (Step::Wildcard, Value::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    Ok(current)
}

fn parse_path(path: &str) -> Result<Vec<Step>> {
    let bad = |why: &str| ScrapeError::Parse(format!("invalid json path {path}: {why}"));
    let rest = path.trim();
    let rest = rest.strip_prefix('$').unwrap_or(rest);
    let chars: Vec<char> = rest.chars().collect();

    let mut steps = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if chars.get(i) == Some(&'*') {
                    steps.push(Step::Wildcard);
                    i += 1;
                    continue;
                }
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                if start == i {
                    return Err(bad("empty key"));
                }
                steps.push(Step::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| bad("unclosed bracket"))?;
                let inner: String = chars[i + 1..i + close].iter().collect();
                let inner = inner.trim();
                let step = if inner == "*" {
                    Step::Wildcard
                } else if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                {
                    Step::Key(quoted.to_string())
                } else {
                    Step::Index(inner.parse().map_err(|_| bad("bad index"))?)
                };
                steps.push(step);
                i += close + 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                steps.push(Step::Key(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(steps)
}
