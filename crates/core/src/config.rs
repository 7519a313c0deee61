use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrapeError};
use crate::time::{Period, parse_duration_str};

pub const DEFAULT_MEASUREMENT: &str = "grafana";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Config {
    pub url: String,
    pub api_key: Option<String>,
    pub dashboards: Vec<String>,
    pub rows: Vec<String>,
    pub measurement: String,
    pub max_concurrent_fetches: usize,
    pub insecure_skip_verify: bool,
    pub poll_interval: Duration,
    pub defaults: MetricDefaults,
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricDefaults {
    pub duration: Duration,
    pub origin: String,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricConfig {
    pub name: String,
    pub value: Option<String>,
    // Declaration order matters: later expressions see tags written by earlier ones.
    pub tags: Vec<(String, String)>,
    pub duration: Option<Duration>,
    pub origin: Option<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub panels: Vec<String>,
}

impl Default for MetricDefaults {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5 * 60),
            origin: "now-5m".to_string(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            api_key: None,
            dashboards: Vec::new(),
            rows: Vec::new(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
            max_concurrent_fetches: 16,
            insecure_skip_verify: true,
            poll_interval: Duration::from_secs(60),
            defaults: MetricDefaults::default(),
            metrics: Vec::new(),
        }
    }
}

impl MetricConfig {
    pub fn period(&self, defaults: &MetricDefaults) -> Period {
        Period::new(
            self.duration.unwrap_or(defaults.duration),
            self.origin.as_deref().unwrap_or(&defaults.origin),
        )
    }

    pub fn interval(&self, defaults: &MetricDefaults) -> Duration {
        self.interval.unwrap_or(defaults.interval)
    }

    pub fn timeout(&self, defaults: &MetricDefaults) -> Duration {
        self.timeout.unwrap_or(defaults.timeout)
    }
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::default();
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(config_file_path);
        match load_file(&path)? {
            Some(file) => apply_file(&mut cfg, file, &path.display().to_string())?,
            None if explicit.is_some() => {
                return Err(ScrapeError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            None => {}
        }
        apply_env(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg = Self::default();
        let file: FileConfig = toml::from_str(raw)
            .map_err(|e| ScrapeError::Config(format!("failed parsing config: {e}")))?;
        apply_file(&mut cfg, file, "config string")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ScrapeError::Config("url cannot be empty".to_string()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ScrapeError::Config(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    url: Option<String>,
    api_key: Option<String>,
    dashboards: Option<Vec<String>>,
    rows: Option<Vec<String>>,
    measurement: Option<String>,
    max_concurrent_fetches: Option<usize>,
    insecure_skip_verify: Option<bool>,
    poll_interval: Option<String>,
    defaults: Option<FileDefaults>,
    #[serde(default)]
    metrics: Vec<FileMetric>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDefaults {
    duration: Option<String>,
    origin: Option<String>,
    interval: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMetric {
    #[serde(default)]
    name: String,
    value: Option<String>,
    #[serde(default)]
    tags: toml::Table,
    duration: Option<String>,
    origin: Option<String>,
    interval: Option<String>,
    timeout: Option<String>,
    #[serde(default)]
    panels: Vec<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("GRAFSCRAPE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("grafscrape/config.toml")
}

fn load_file(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| ScrapeError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: FileConfig = toml::from_str(&raw)
        .map_err(|e| ScrapeError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn apply_file(cfg: &mut Config, file: FileConfig, source: &str) -> Result<()> {
    if let Some(v) = file.url {
        cfg.url = v;
    }
    if let Some(v) = file.api_key {
        cfg.api_key = Some(v);
    }
    if let Some(v) = file.dashboards {
        cfg.dashboards = v;
    }
    if let Some(v) = file.rows {
        cfg.rows = v;
    }
    if let Some(v) = file.measurement {
        cfg.measurement = v;
    }
    if let Some(v) = file.max_concurrent_fetches {
        cfg.max_concurrent_fetches = v;
    }
    if let Some(v) = file.insecure_skip_verify {
        cfg.insecure_skip_verify = v;
    }
    if let Some(v) = file.poll_interval {
        cfg.poll_interval = duration_in(&v, "poll_interval", source)?;
    }
    if let Some(defaults) = file.defaults {
        if let Some(v) = defaults.duration {
            cfg.defaults.duration = duration_in(&v, "defaults.duration", source)?;
        }
        if let Some(v) = defaults.origin {
            cfg.defaults.origin = v;
        }
        if let Some(v) = defaults.interval {
            cfg.defaults.interval = duration_in(&v, "defaults.interval", source)?;
        }
        if let Some(v) = defaults.timeout {
            cfg.defaults.timeout = duration_in(&v, "defaults.timeout", source)?;
        }
    }
    for metric in file.metrics {
        cfg.metrics.push(metric_from_file(metric, source)?);
    }
    Ok(())
}

fn metric_from_file(raw: FileMetric, source: &str) -> Result<MetricConfig> {
    let optional = |value: Option<String>, field: &str| -> Result<Option<Duration>> {
        value
            .map(|v| duration_in(&v, &format!("metrics.{}.{field}", raw.name), source))
            .transpose()
    };

    let mut tags = Vec::with_capacity(raw.tags.len());
    for (tag, expr) in &raw.tags {
        let Some(expr) = expr.as_str() else {
            return Err(ScrapeError::Config(format!(
                "bad metrics.{}.tags.{tag} in {source}: expected a string expression",
                raw.name
            )));
        };
        tags.push((tag.clone(), expr.to_string()));
    }

    Ok(MetricConfig {
        duration: optional(raw.duration.clone(), "duration")?,
        interval: optional(raw.interval.clone(), "interval")?,
        timeout: optional(raw.timeout.clone(), "timeout")?,
        name: raw.name,
        value: raw.value.filter(|v| !v.trim().is_empty()),
        tags,
        origin: raw.origin,
        panels: raw.panels,
    })
}

fn apply_env(cfg: &mut Config) -> Result<()> {
    if let Ok(v) = env::var("GRAFSCRAPE_URL") {
        cfg.url = v;
    }
    if let Ok(v) = env::var("GRAFSCRAPE_API_KEY") {
        cfg.api_key = Some(v);
    }
    if let Ok(v) = env::var("GRAFSCRAPE_MAX_CONCURRENT_FETCHES") {
        cfg.max_concurrent_fetches = v.parse::<usize>().map_err(|e| {
            ScrapeError::Config(format!(
                "bad GRAFSCRAPE_MAX_CONCURRENT_FETCHES in environment: {e}"
            ))
        })?;
    }
    Ok(())
}

fn duration_in(value: &str, field: &str, source: &str) -> Result<Duration> {
    parse_duration_str(value)
        .map_err(|e| ScrapeError::Config(format!("bad {field} in {source}: {e} (value={value})")))
}
