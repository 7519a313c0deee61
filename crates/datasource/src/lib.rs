pub mod clickhouse;
pub mod decode;
pub mod elasticsearch;
pub mod influxdb;
pub mod json_api;
pub mod netdata;
pub mod prometheus;
pub mod registry;
pub mod transport;

use std::future::Future;
use std::time::Duration;

use grafscrape_core::Result;
use grafscrape_core::model::dashboard::Target;
use grafscrape_core::model::datasource::DatasourceRef;
use grafscrape_core::model::point::Point;
use grafscrape_core::time::Period;

pub use registry::DatasourceKind;
pub use transport::{Transport, TransportConfig};

pub type Push<'a> = dyn FnMut(Point) + Send + 'a;

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub target: &'a Target,
    pub datasource: &'a DatasourceRef,
    pub period: &'a Period,
    pub interval: Duration,
}

// `push` is synchronous and only ever driven by the task that owns the fetch. No data is
// a successful fetch with zero pushes; errors are for transport or decode failures.
pub trait Datasource {
    fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> impl Future<Output = Result<()>> + Send;
}
