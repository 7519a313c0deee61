use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ROW_PANEL: &str = "row";
const GRAPH_PANELS: [&str; 2] = ["graph", "timeseries"];

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardEnvelope {
    pub dashboard: Dashboard,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dashboard {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Panel {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub datasource: Option<DatasourceSelector>,
    #[serde(default)]
    pub targets: Vec<Target>,
    // Only collapsed rows carry children.
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl Panel {
    pub fn is_row(&self) -> bool {
        self.kind == ROW_PANEL
    }

    pub fn is_graph(&self) -> bool {
        GRAPH_PANELS.contains(&self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasourceSelector {
    Name(String),
    Ref {
        #[serde(default)]
        uid: Option<String>,
        #[serde(rename = "type", default)]
        kind: Option<String>,
    },
}

impl DatasourceSelector {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Name(name) => name.is_empty(),
            Self::Ref { uid, kind } => {
                uid.as_deref().unwrap_or_default().is_empty()
                    && kind.as_deref().unwrap_or_default().is_empty()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "refId", default)]
    pub ref_id: String,
    #[serde(default)]
    pub hide: Option<bool>,
    #[serde(default)]
    pub datasource: Option<DatasourceSelector>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Target {
    pub fn is_hidden(&self) -> bool {
        self.hide.unwrap_or(false)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn array_field(&self, key: &str) -> &[Value] {
        self.field(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
