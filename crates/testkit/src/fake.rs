use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

const PROXY_PREFIX: &str = "/api/datasources/proxy/";

#[derive(Debug, Clone)]
pub struct Backend {
    pub delay: Duration,
    pub status: StatusCode,
    pub body: Value,
}

impl Backend {
    pub fn json(body: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            status: StatusCode::OK,
            body,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub datasource_id: i64,
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeGrafanaBuilder {
    api_key: Option<String>,
    dashboards: Vec<Value>,
    datasources: Vec<Value>,
    backends: HashMap<i64, Backend>,
}

impl FakeGrafanaBuilder {
    pub fn api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn dashboard(mut self, dashboard: Value) -> Self {
        self.dashboards.push(dashboard);
        self
    }

    pub fn datasources(mut self, datasources: Value) -> Self {
        if let Value::Array(items) = datasources {
            self.datasources.extend(items);
        }
        self
    }

    pub fn backend(mut self, datasource_id: i64, backend: Backend) -> Self {
        self.backends.insert(datasource_id, backend);
        self
    }

    pub async fn start(self) -> anyhow::Result<FakeGrafana> {
        let shared = Arc::new(Shared {
            api_key: self.api_key,
            dashboards: self.dashboards,
            datasources: self.datasources,
            backends: self.backends,
            proxied: Mutex::new(Vec::new()),
            api_calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/api/dashboards/uid/{uid}", get(dashboard_by_uid))
            .route("/api/search", get(search))
            .route("/api/datasources", get(list_datasources))
            .fallback(proxy)
            .with_state(Arc::clone(&shared));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(FakeGrafana { addr, shared, task })
    }
}

#[derive(Debug)]
struct Shared {
    api_key: Option<String>,
    dashboards: Vec<Value>,
    datasources: Vec<Value>,
    backends: HashMap<i64, Backend>,
    proxied: Mutex<Vec<ProxiedRequest>>,
    api_calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Shared {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(key) = &self.api_key else {
            return Ok(());
        };
        let expected = format!("Bearer {key}");
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(got) if got == expected => Ok(()),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    fn record_call(&self, call: String) {
        if let Ok(mut calls) = self.api_calls.lock() {
            calls.push(call);
        }
    }
}

pub struct FakeGrafana {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeGrafana {
    pub fn builder() -> FakeGrafanaBuilder {
        FakeGrafanaBuilder::default()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn proxied(&self) -> Vec<ProxiedRequest> {
        self.shared
            .proxied
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn api_calls(&self) -> Vec<String> {
        self.shared
            .api_calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }
}

impl Drop for FakeGrafana {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn dashboard_by_uid(
    State(shared): State<Arc<Shared>>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = shared.authorize(&headers) {
        return status.into_response();
    }
    shared.record_call(format!("dashboard:{uid}"));
    match shared
        .dashboards
        .iter()
        .find(|d| d.get("uid").and_then(Value::as_str) == Some(uid.as_str()))
    {
        Some(dashboard) => Json(json!({"dashboard": dashboard, "meta": {}})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Dashboard not found"})),
        )
            .into_response(),
    }
}

async fn search(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = shared.authorize(&headers) {
        return status.into_response();
    }
    let query = params.get("query").cloned().unwrap_or_default();
    shared.record_call(format!("search:{query}"));
    let hits: Vec<Value> = shared
        .dashboards
        .iter()
        .filter(|d| {
            d.get("title")
                .and_then(Value::as_str)
                .is_some_and(|t| t.to_lowercase().contains(&query.to_lowercase()))
        })
        .map(|d| json!({"uid": d["uid"], "title": d["title"], "type": "dash-db"}))
        .collect();
    Json(hits).into_response()
}

async fn list_datasources(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> Response {
    if let Err(status) = shared.authorize(&headers) {
        return status.into_response();
    }
    shared.record_call("datasources".to_string());
    Json(shared.datasources.clone()).into_response()
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn proxy(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(rest) = uri.path().strip_prefix(PROXY_PREFIX) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (id, path) = rest.split_once('/').unwrap_or((rest, ""));
    let Ok(datasource_id) = id.parse::<i64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Err(status) = shared.authorize(&headers) {
        return status.into_response();
    }

    if let Ok(mut proxied) = shared.proxied.lock() {
        proxied.push(ProxiedRequest {
            datasource_id,
            method: method.clone(),
            path: path.to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
            authorization: headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });
    }

    let Some(backend) = shared.backends.get(&datasource_id).cloned() else {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"message": "no backend"})),
        )
            .into_response();
    };

    let current = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak.fetch_max(current, Ordering::SeqCst);
    let _guard = InFlight(&shared.in_flight);
    if !backend.delay.is_zero() {
        tokio::time::sleep(backend.delay).await;
    }
    (backend.status, Json(backend.body)).into_response()
}
