use std::time::Duration;

use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::datasource::{DatasourceRef, HttpMethod};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub insecure_skip_verify: bool,
}

// One per worker; the timeout bounds both the connect/TLS phase and the whole exchange.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl Transport {
    pub fn new(cfg: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(cfg.timeout)
            .timeout(cfg.timeout)
            .danger_accept_invalid_certs(cfg.insecure_skip_verify)
            .build()
            .map_err(|e| ScrapeError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }

    pub fn proxy_url(&self, ds: &DatasourceRef, path: &str) -> String {
        format!(
            "{}/api/datasources/proxy/{}/{}",
            self.base_url,
            ds.id,
            path.trim_start_matches('/')
        )
    }

    // Parameters travel as a query string or a form body depending on the datasource's
    // configured HTTP method.
    pub async fn query<T: DeserializeOwned>(
        &self,
        ds: &DatasourceRef,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = self.proxy_url(ds, path);
        let req = match ds.http_method() {
            HttpMethod::Get => self.client.get(&url).query(params),
            HttpMethod::Post => self.client.post(&url).form(params),
        };
        self.send_json(req, &url).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        ds: &DatasourceRef,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = self.proxy_url(ds, path);
        let req = self.client.get(&url).query(params);
        self.send_json(req, &url).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        ds: &DatasourceRef,
        path: &str,
        params: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = self.proxy_url(ds, path);
        let req = self.client.post(&url).query(params).json(body);
        self.send_json(req, &url).await
    }

    pub async fn post_text<T: DeserializeOwned>(
        &self,
        ds: &DatasourceRef,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<T> {
        let url = self.proxy_url(ds, path);
        let req = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        self.send_json(req, &url).await
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, url: &str) -> Result<T> {
        let bytes = self.send(req, url).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ScrapeError::Decode(format!("malformed response from {url}: {e}")))
    }

    async fn send(&self, req: RequestBuilder, url: &str) -> Result<Vec<u8>> {
        let mut req = req.header(ACCEPT, "application/json");
        if let Some(key) = &self.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ScrapeError::Http(format!("request to {url} failed: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ScrapeError::Http(format!("reading body from {url} failed: {e}")))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate(&body, ERROR_BODY_LIMIT),
            });
        }
        Ok(bytes.to_vec())
    }
}

fn truncate(raw: &str, limit: usize) -> String {
    if raw.len() <= limit {
        return raw.to_string();
    }
    let mut end = limit;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
