use std::sync::Arc;
use std::time::Duration;

use grafscrape_core::config::{Config, MetricConfig, MetricDefaults};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::time::Period;
use regex::Regex;

use crate::expr::Expression;

#[derive(Debug)]
pub struct MetricDefinition {
    pub name: String,
    pub value: Option<Expression>,
    pub tags: Vec<(String, Expression)>,
    pub period: Period,
    pub interval: Duration,
    pub timeout: Duration,
    panels: Vec<Regex>,
}

impl MetricDefinition {
    pub fn from_config(cfg: &MetricConfig, defaults: &MetricDefaults) -> Result<Self> {
        let label = if cfg.name.is_empty() {
            "<unnamed>"
        } else {
            cfg.name.as_str()
        };
        let invalid = |what: &str, e: &dyn std::fmt::Display| {
            ScrapeError::Config(format!("metric {label}: invalid {what}: {e}"))
        };

        let value = cfg
            .value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .map(Expression::compile)
            .transpose()
            .map_err(|e| invalid("value expression", &e))?;

        let mut tags = Vec::with_capacity(cfg.tags.len());
        for (name, source) in &cfg.tags {
            let expr = Expression::compile(source).map_err(|e| invalid("tag expression", &e))?;
            tags.push((name.clone(), expr));
        }

        let mut panels = Vec::with_capacity(cfg.panels.len());
        for pattern in &cfg.panels {
            panels.push(Regex::new(pattern).map_err(|e| invalid("panel pattern", &e))?);
        }

        Ok(Self {
            name: cfg.name.clone(),
            value,
            tags,
            period: cfg.period(defaults),
            interval: cfg.interval(defaults),
            timeout: cfg.timeout(defaults),
            panels,
        })
    }

    pub fn matches(&self, title: &str) -> bool {
        self.panels.iter().any(|re| re.is_match(title))
    }

    pub fn is_uninstrumented(&self) -> bool {
        self.name.is_empty()
    }

    pub fn panel_patterns(&self) -> impl Iterator<Item = &str> {
        self.panels.iter().map(Regex::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct MetricSet {
    definitions: Vec<Arc<MetricDefinition>>,
}

impl MetricSet {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.metrics.is_empty() {
            return Err(ScrapeError::NoMetrics);
        }
        let definitions = config
            .metrics
            .iter()
            .map(|m| MetricDefinition::from_config(m, &config.defaults).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { definitions })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MetricDefinition>> {
        self.definitions.iter()
    }

    // First configured definition wins. A winning definition without a name marks the
    // panel as deliberately uninstrumented; later definitions are not consulted.
    pub fn select(&self, title: &str) -> Option<Arc<MetricDefinition>> {
        let found = self.definitions.iter().find(|d| d.matches(title))?;
        if found.is_uninstrumented() {
            tracing::debug!(panel = title, "panel matched an unnamed metric, skipping");
            return None;
        }
        Some(Arc::clone(found))
    }
}
