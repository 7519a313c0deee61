use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub collected_at: DateTime<Utc>,
    pub tags: Tags,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

impl Point {
    pub fn new(collected_at: DateTime<Utc>, tags: Tags, ts: DateTime<Utc>, value: f64) -> Self {
        Self {
            collected_at,
            tags,
            ts,
            value,
        }
    }
}
