use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::dashboard::DatasourceSelector;

const DEFAULT_NAME: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Proxy,
    Direct,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRef {
    pub id: i64,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub access: AccessMode,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: String,
    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
    #[serde(rename = "jsonData", default)]
    pub json_data: Map<String, Value>,
}

impl DatasourceRef {
    pub fn is_proxy(&self) -> bool {
        self.access == AccessMode::Proxy
    }

    pub fn http_method(&self) -> HttpMethod {
        match self.json_str("httpMethod") {
            Some(m) if m.eq_ignore_ascii_case("post") => HttpMethod::Post,
            _ => HttpMethod::Get,
        }
    }

    pub fn json_str(&self, key: &str) -> Option<&str> {
        self.json_data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasourceCatalog {
    sources: Vec<DatasourceRef>,
}

impl DatasourceCatalog {
    pub fn new(sources: Vec<DatasourceRef>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn default_source(&self) -> Option<&DatasourceRef> {
        self.sources.iter().find(|ds| ds.is_default)
    }

    pub fn lookup(&self, selector: &DatasourceSelector) -> Option<&DatasourceRef> {
        match selector {
            DatasourceSelector::Name(name) if name == DEFAULT_NAME => self.default_source(),
            DatasourceSelector::Name(name) => self
                .sources
                .iter()
                .find(|ds| &ds.name == name)
                .or_else(|| self.sources.iter().find(|ds| &ds.uid == name)),
            DatasourceSelector::Ref { uid, kind } => {
                if let Some(uid) = uid.as_deref().filter(|u| !u.is_empty()) {
                    return self.sources.iter().find(|ds| ds.uid == uid);
                }
                let kind = kind.as_deref()?;
                self.default_source()
                    .filter(|ds| ds.kind == kind)
                    .or_else(|| self.sources.iter().find(|ds| ds.kind == kind))
            }
        }
    }

    // Target override, then panel, then the account default. The first selector present
    // decides; an unresolvable one is not retried further down the chain.
    pub fn resolve(
        &self,
        target: Option<&DatasourceSelector>,
        panel: Option<&DatasourceSelector>,
    ) -> Option<&DatasourceRef> {
        let selector = target
            .filter(|s| !s.is_empty())
            .or_else(|| panel.filter(|s| !s.is_empty()));
        match selector {
            Some(selector) => self.lookup(selector),
            None => self.default_source(),
        }
    }
}
