pub mod collector;
pub mod dispatch;
pub mod expr;
pub mod grafana;
pub mod metric;
pub mod sink;
pub mod transform;
pub mod walker;

pub use collector::{Collector, CycleReport};
pub use dispatch::{Dispatcher, Job, PanelReport};
pub use grafana::GrafanaClient;
pub use metric::{MetricDefinition, MetricSet};
pub use sink::{Fields, Sink};
pub use transform::{PanelContext, PointTransformer};
