use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use grafscrape_core::config::Config;
use grafscrape_core::error::{Result, ScrapeError};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, plan_jobs};
use crate::grafana::GrafanaClient;
use crate::metric::MetricSet;
use crate::sink::Sink;
use crate::transform::PanelContext;
use crate::walker::{RowFilter, select_panels};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dashboards: usize,
    pub dashboard_failures: usize,
    pub panels_matched: usize,
    pub targets_dispatched: usize,
    pub fetch_failures: usize,
    pub points: usize,
}

pub struct Collector {
    config: Config,
    client: GrafanaClient,
    dispatcher: Dispatcher,
    rows: RowFilter,
    reported_no_metrics: AtomicBool,
}

impl Collector {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let rows = RowFilter::new(&config.rows)?;
        match MetricSet::from_config(&config) {
            Ok(_) | Err(ScrapeError::NoMetrics) => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            client: GrafanaClient::new(&config)?,
            dispatcher: Dispatcher::new(&config),
            rows,
            config,
            reported_no_metrics: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Dashboards are walked one after another; only the targets of a single panel run in
    // parallel. A failing dashboard is logged and the cycle moves on.
    pub async fn run_cycle(&self, sink: &Arc<dyn Sink>) -> Result<CycleReport> {
        let metrics = match MetricSet::from_config(&self.config) {
            Ok(metrics) => metrics,
            Err(ScrapeError::NoMetrics) => {
                if !self.reported_no_metrics.swap(true, Ordering::Relaxed) {
                    error!("no metrics configured, nothing to collect");
                }
                return Err(ScrapeError::NoMetrics);
            }
            Err(e) => return Err(e),
        };

        let mut report = CycleReport::default();
        for id in &self.config.dashboards {
            report.dashboards += 1;
            if let Err(e) = self.collect_dashboard(id, &metrics, sink, &mut report).await {
                warn!(dashboard = %id, error = %e, "dashboard collection failed");
                report.dashboard_failures += 1;
            }
        }

        info!(
            dashboards = report.dashboards,
            panels = report.panels_matched,
            targets = report.targets_dispatched,
            failures = report.fetch_failures,
            points = report.points,
            "collection cycle finished"
        );
        Ok(report)
    }

    async fn collect_dashboard(
        &self,
        id: &str,
        metrics: &MetricSet,
        sink: &Arc<dyn Sink>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let dashboard = self.client.dashboard(id).await?;
        let catalog = self.client.datasources().await?;
        debug!(
            dashboard = %dashboard.title,
            panels = dashboard.panels.len(),
            datasources = catalog.len(),
            "walking dashboard"
        );

        for selected in select_panels(&dashboard, &self.rows) {
            let title = &selected.panel.title;
            let Some(metric) = metrics.select(title) else {
                debug!(panel = %title, "no metric matches panel");
                continue;
            };
            let jobs = plan_jobs(selected.panel, &catalog);
            if jobs.is_empty() {
                debug!(panel = %title, "panel has no dispatchable targets");
                continue;
            }
            report.panels_matched += 1;

            let panel = Arc::new(PanelContext {
                title: title.clone(),
                row: selected.row.map(str::to_string),
                metric,
            });
            let outcome = self.dispatcher.dispatch_panel(panel, jobs, sink).await;
            report.targets_dispatched += outcome.dispatched;
            report.fetch_failures += outcome.failed;
            report.points += outcome.points;
        }
        Ok(())
    }
}
