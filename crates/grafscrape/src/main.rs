mod output;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use grafscrape_collect::{Collector, CycleReport, MetricSet, Sink};
use grafscrape_core::ScrapeError;
use grafscrape_core::config::Config;
use tokio::time::MissedTickBehavior;

use crate::output::{LineProtocolSink, print_check};
use crate::telemetry::{LogFormat, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "grafscrape")]
#[command(about = "Scrape Grafana dashboard panels into influx line protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Poll the configured dashboards and print points to stdout")]
    Run {
        #[arg(long, help = "Run a single collection cycle and exit")]
        once: bool,
    },
    #[command(about = "Validate the configuration and list metric definitions")]
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = Config::load(cli.config.as_deref()).context("load config")?;
    match cli.command {
        Commands::Run { once } => run(config, once).await,
        Commands::Check => check(config),
    }
}

fn check(config: Config) -> anyhow::Result<()> {
    Collector::new(config.clone()).context("invalid configuration")?;
    match MetricSet::from_config(&config) {
        Ok(metrics) => print_check(&config, Some(&metrics)),
        Err(ScrapeError::NoMetrics) => print_check(&config, None),
        Err(e) => return Err(e).context("invalid metric definitions"),
    }
    Ok(())
}

async fn run(config: Config, once: bool) -> anyhow::Result<()> {
    let poll_interval = config.poll_interval;
    let collector = Collector::new(config).context("initialise collector")?;
    let sink: Arc<dyn Sink> = Arc::new(LineProtocolSink::new(std::io::stdout()));

    if once {
        let report = collector.run_cycle(&sink).await?;
        log_report(&report);
        return Ok(());
    }

    tracing::info!(
        url = %collector.config().url,
        dashboards = collector.config().dashboards.len(),
        poll_interval = %humantime::format_duration(poll_interval),
        "grafscrape running"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => break,
        }
        tokio::select! {
            res = collector.run_cycle(&sink) => match res {
                Ok(report) => log_report(&report),
                // Reported once by the collector itself.
                Err(ScrapeError::NoMetrics) => {}
                Err(e) => tracing::warn!(error = %e, "collection cycle failed"),
            },
            _ = &mut ctrl_c => break,
        }
    }

    tracing::info!("received ctrl-c, shutting down");
    Ok(())
}

fn log_report(report: &CycleReport) {
    if report.dashboard_failures > 0 || report.fetch_failures > 0 {
        tracing::warn!(
            dashboard_failures = report.dashboard_failures,
            fetch_failures = report.fetch_failures,
            "cycle completed with failures"
        );
    }
}
