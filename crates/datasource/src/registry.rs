use grafscrape_core::Result;

use crate::clickhouse::ClickHouse;
use crate::elasticsearch::Elasticsearch;
use crate::influxdb::InfluxDb;
use crate::json_api::JsonApi;
use crate::netdata::Netdata;
use crate::prometheus::Prometheus;
use crate::{Datasource, FetchRequest, Push, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceKind {
    Prometheus,
    InfluxDb,
    ClickHouse,
    Netdata,
    JsonApi,
    Elasticsearch,
}

impl DatasourceKind {
    pub fn from_type(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "prometheus" => Some(Self::Prometheus),
            "influxdb" => Some(Self::InfluxDb),
            "elasticsearch" => Some(Self::Elasticsearch),
            "vertamedia-clickhouse-datasource" | "grafana-clickhouse-datasource" | "clickhouse" => {
                Some(Self::ClickHouse)
            }
            "netdata" | "netdata-datasource" => Some(Self::Netdata),
            "marcusolsson-json-datasource" | "simpod-json-datasource" | "json" => {
                Some(Self::JsonApi)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::InfluxDb => "influxdb",
            Self::ClickHouse => "clickhouse",
            Self::Netdata => "netdata",
            Self::JsonApi => "json",
            Self::Elasticsearch => "elasticsearch",
        }
    }

    pub async fn fetch_series(
        self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        match self {
            Self::Prometheus => Prometheus.fetch_series(transport, req, push).await,
            Self::InfluxDb => InfluxDb.fetch_series(transport, req, push).await,
            Self::ClickHouse => ClickHouse.fetch_series(transport, req, push).await,
            Self::Netdata => Netdata.fetch_series(transport, req, push).await,
            Self::JsonApi => JsonApi.fetch_series(transport, req, push).await,
            Self::Elasticsearch => Elasticsearch.fetch_series(transport, req, push).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_type_tags() {
        assert_eq!(
            DatasourceKind::from_type("prometheus"),
            Some(DatasourceKind::Prometheus)
        );
        assert_eq!(
            DatasourceKind::from_type("Elasticsearch"),
            Some(DatasourceKind::Elasticsearch)
        );
        assert_eq!(
            DatasourceKind::from_type("vertamedia-clickhouse-datasource"),
            Some(DatasourceKind::ClickHouse)
        );
        assert_eq!(
            DatasourceKind::from_type("marcusolsson-json-datasource"),
            Some(DatasourceKind::JsonApi)
        );
        assert_eq!(DatasourceKind::from_type("graphite"), None);
        assert_eq!(DatasourceKind::from_type("-- Mixed --"), None);
    }
}
