use std::sync::Arc;
use std::time::Instant;

use grafscrape_core::config::Config;
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::{Panel, Target};
use grafscrape_core::model::datasource::{DatasourceCatalog, DatasourceRef};
use grafscrape_core::model::point::Point;
use grafscrape_datasource::{DatasourceKind, FetchRequest, Transport, TransportConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::sink::Sink;
use crate::transform::{PanelContext, PointTransformer};

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub target: Target,
    pub datasource: DatasourceRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PanelReport {
    pub dispatched: usize,
    pub failed: usize,
    pub points: usize,
}

// Every visible target paired with the datasource it resolves to. Targets without a usable
// proxied datasource are skipped here.
pub fn plan_jobs(panel: &Panel, catalog: &DatasourceCatalog) -> Vec<Job> {
    let mut jobs = Vec::new();
    for target in &panel.targets {
        if target.is_hidden() {
            continue;
        }
        let Some(ds) = catalog.resolve(target.datasource.as_ref(), panel.datasource.as_ref())
        else {
            debug!(panel = %panel.title, ref_id = %target.ref_id, "no datasource resolved");
            continue;
        };
        if !ds.is_proxy() {
            debug!(
                panel = %panel.title,
                datasource = %ds.name,
                "datasource is not proxied, skipping"
            );
            continue;
        }
        jobs.push(Job {
            target: target.clone(),
            datasource: ds.clone(),
        });
    }
    jobs
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<Semaphore>,
    base_url: String,
    api_key: Option<String>,
    insecure_skip_verify: bool,
    measurement: Arc<str>,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(cfg.max_concurrent_fetches)),
            base_url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            insecure_skip_verify: cfg.insecure_skip_verify,
            measurement: Arc::from(cfg.measurement.as_str()),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.pool.available_permits()
    }

    // Jobs run concurrently, bounded by the shared pool, and all finish before this returns.
    pub async fn dispatch_panel(
        &self,
        panel: Arc<PanelContext>,
        jobs: Vec<Job>,
        sink: &Arc<dyn Sink>,
    ) -> PanelReport {
        let mut report = PanelReport::default();
        let mut tasks = JoinSet::new();

        for job in jobs {
            let Some(kind) = DatasourceKind::from_type(&job.datasource.kind) else {
                warn!(
                    panel = %panel.title,
                    datasource = %job.datasource.name,
                    kind = %job.datasource.kind,
                    "unsupported datasource type, skipping target"
                );
                continue;
            };
            report.dispatched += 1;

            let worker = Worker {
                pool: Arc::clone(&self.pool),
                transport: TransportConfig {
                    base_url: self.base_url.clone(),
                    api_key: self.api_key.clone(),
                    timeout: panel.metric.timeout,
                    insecure_skip_verify: self.insecure_skip_verify,
                },
                panel: Arc::clone(&panel),
                measurement: Arc::clone(&self.measurement),
                sink: Arc::clone(sink),
                dispatched_at: Instant::now(),
            };
            tasks.spawn(worker.run(kind, job));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(points)) => report.points += points,
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    warn!(panel = %panel.title, error = %e, "fetch task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

struct Worker {
    pool: Arc<Semaphore>,
    transport: TransportConfig,
    panel: Arc<PanelContext>,
    measurement: Arc<str>,
    sink: Arc<dyn Sink>,
    // Taken at spawn, so time spent waiting for a pool permit counts toward fetch_ms.
    dispatched_at: Instant,
}

impl Worker {
    async fn run(self, kind: DatasourceKind, job: Job) -> Result<usize> {
        let result = self.fetch(kind, &job).await;
        if let Err(e) = &result {
            warn!(
                panel = %self.panel.title,
                datasource = %job.datasource.name,
                kind = kind.as_str(),
                ref_id = %job.target.ref_id,
                error = %e,
                "fetch failed"
            );
        }
        result
    }

    async fn fetch(&self, kind: DatasourceKind, job: &Job) -> Result<usize> {
        let _permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| ScrapeError::Internal("fetch pool closed".to_string()))?;

        let transport = Transport::new(&self.transport)?;
        let transformer = PointTransformer::new(
            Arc::clone(&self.panel),
            &job.datasource,
            Arc::clone(&self.measurement),
            Arc::clone(&self.sink),
            self.dispatched_at,
        );
        let metric = &self.panel.metric;
        let req = FetchRequest {
            target: &job.target,
            datasource: &job.datasource,
            period: &metric.period,
            interval: metric.interval,
        };

        let mut forwarded = 0;
        let mut push = |point: Point| {
            if transformer.apply(point) {
                forwarded += 1;
            }
        };
        kind.fetch_series(&transport, &req, &mut push).await?;
        Ok(forwarded)
    }
}
