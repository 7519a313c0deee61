use std::time::Duration;

use grafscrape_core::config::Config;
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::{Dashboard, DashboardEnvelope, SearchHit};
use grafscrape_core::model::datasource::{DatasourceCatalog, DatasourceRef};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

const DASHBOARD_SEARCH_TYPE: &str = "dash-db";

#[derive(Debug, Clone)]
pub struct GrafanaClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GrafanaClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_timeout(cfg, cfg.defaults.timeout)
    }

    pub fn with_timeout(cfg: &Config, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .danger_accept_invalid_certs(cfg.insecure_skip_verify)
            .build()
            .map_err(|e| ScrapeError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // Identifiers are tried as a uid first, then as an exact dashboard title.
    pub async fn dashboard(&self, id: &str) -> Result<Dashboard> {
        match self.dashboard_by_uid(id).await {
            Err(ScrapeError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                let hit = self
                    .search(id)
                    .await?
                    .into_iter()
                    .find(|hit| hit.title == id)
                    .ok_or_else(|| {
                        ScrapeError::Config(format!("no dashboard with uid or title {id:?}"))
                    })?;
                self.dashboard_by_uid(&hit.uid).await
            }
            other => other,
        }
    }

    pub async fn dashboard_by_uid(&self, uid: &str) -> Result<Dashboard> {
        let envelope: DashboardEnvelope = self
            .get_json(&format!("api/dashboards/uid/{uid}"), &[])
            .await?;
        Ok(envelope.dashboard)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.get_json(
            "api/search",
            &[("type", DASHBOARD_SEARCH_TYPE), ("query", query)],
        )
        .await
    }

    pub async fn datasources(&self) -> Result<DatasourceCatalog> {
        let sources: Vec<DatasourceRef> = self.get_json("api/datasources", &[]).await?;
        Ok(DatasourceCatalog::new(sources))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self
            .client
            .get(&url)
            .query(query)
            .header(ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ScrapeError::Http(format!("request to {url} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                url,
                body: body.chars().take(512).collect(),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ScrapeError::Decode(format!("malformed response from {url}: {e}")))
    }
}
