use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use grafscrape_core::model::point::Tags;

pub type Fields = BTreeMap<String, f64>;

// Called concurrently from every fetch worker.
pub trait Sink: Send + Sync {
    fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags, ts: DateTime<Utc>);
}
