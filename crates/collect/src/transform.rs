use std::sync::Arc;
use std::time::Instant;

use chrono::SecondsFormat;
use evalexpr::{ContextWithMutableVariables, Value};
use grafscrape_core::model::datasource::DatasourceRef;
use grafscrape_core::model::point::Point;

use crate::expr::{VALUE_VAR, point_context};
use crate::metric::MetricDefinition;
use crate::sink::{Fields, Sink};

pub const COLLECTED_AT_TAG: &str = "collected_at";
pub const FETCH_MS_TAG: &str = "fetch_ms";
pub const PANEL_TAG: &str = "panel";
pub const ROW_TAG: &str = "row";
pub const DATASOURCE_TYPE_TAG: &str = "datasource_type";
pub const DATASOURCE_TAG: &str = "datasource";

#[derive(Debug)]
pub struct PanelContext {
    pub title: String,
    pub row: Option<String>,
    pub metric: Arc<MetricDefinition>,
}

pub struct PointTransformer {
    panel: Arc<PanelContext>,
    datasource_type: String,
    datasource_name: String,
    measurement: Arc<str>,
    sink: Arc<dyn Sink>,
    dispatched_at: Instant,
}

impl PointTransformer {
    pub fn new(
        panel: Arc<PanelContext>,
        datasource: &DatasourceRef,
        measurement: Arc<str>,
        sink: Arc<dyn Sink>,
        dispatched_at: Instant,
    ) -> Self {
        Self {
            panel,
            datasource_type: datasource.kind.clone(),
            datasource_name: datasource.name.clone(),
            measurement,
            sink,
            dispatched_at,
        }
    }

    // Returns whether the point reached the sink.
    pub fn apply(&self, point: Point) -> bool {
        let metric = &self.panel.metric;
        let Point {
            collected_at,
            mut tags,
            ts,
            mut value,
        } = point;

        if metric.value.is_some() || !metric.tags.is_empty() {
            let mut ctx = point_context(value, ts.timestamp_millis(), &tags);
            if let Some(expr) = &metric.value {
                match expr.eval_number(&ctx) {
                    Ok(v) => {
                        value = v;
                        let _ = ctx.set_value(VALUE_VAR.to_string(), Value::Float(v));
                    }
                    Err(e) => tracing::warn!(
                        metric = %metric.name,
                        panel = %self.panel.title,
                        error = %e,
                        "value expression failed, keeping raw value"
                    ),
                }
            }
            for (name, expr) in &metric.tags {
                match expr.eval_text(&ctx) {
                    Ok(v) => {
                        let _ = ctx.set_value(name.clone(), Value::String(v.clone()));
                        tags.insert(name.clone(), v);
                    }
                    Err(e) => tracing::warn!(
                        metric = %metric.name,
                        tag = %name,
                        error = %e,
                        "tag expression failed, skipping tag"
                    ),
                }
            }
        }

        if !value.is_finite() {
            tracing::debug!(
                metric = %metric.name,
                panel = %self.panel.title,
                value,
                "dropping non-finite point"
            );
            return false;
        }

        tags.insert(
            COLLECTED_AT_TAG.to_string(),
            collected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        tags.insert(
            FETCH_MS_TAG.to_string(),
            self.dispatched_at.elapsed().as_millis().to_string(),
        );
        tags.insert(PANEL_TAG.to_string(), self.panel.title.clone());
        if let Some(row) = &self.panel.row {
            tags.insert(ROW_TAG.to_string(), row.clone());
        }
        tags.insert(
            DATASOURCE_TYPE_TAG.to_string(),
            self.datasource_type.clone(),
        );
        tags.insert(DATASOURCE_TAG.to_string(), self.datasource_name.clone());

        let mut fields = Fields::new();
        fields.insert(metric.name.clone(), value);
        self.sink.add_fields(&self.measurement, fields, tags, ts);
        true
    }
}
