use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serial_test::serial;
use testkit::{Backend, FakeGrafana, PROMETHEUS_ID, prometheus_matrix, sample_dashboard, sample_datasources};

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_grafscrape")
}

fn write_config(dir: &Path, url: &str, metrics: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("grafscrape.toml");
    std::fs::write(
        &path,
        format!(
            r#"
url = "{url}"
api_key = "test-key"
dashboards = ["svc"]
poll_interval = "30s"

[defaults]
duration = "5m"
origin = "now-5m"
interval = "1m"
timeout = "5s"

{metrics}
"#
        ),
    )?;
    Ok(path)
}

const REQUESTS: &str = r#"
[[metrics]]
name = "requests"
value = "value * 2"
panels = ["^Requests$"]
"#;

async fn grafscrape(args: Vec<String>, envs: Vec<(&'static str, String)>) -> anyhow::Result<Output> {
    let output = tokio::task::spawn_blocking(move || {
        let mut cmd = Command::new(bin());
        cmd.args(&args)
            .env("RUST_LOG", "warn")
            .env_remove("GRAFSCRAPE_CONFIG")
            .env_remove("GRAFSCRAPE_URL")
            .env_remove("GRAFSCRAPE_API_KEY")
            .env_remove("GRAFSCRAPE_MAX_CONCURRENT_FETCHES");
        for (key, value) in envs {
            cmd.env(key, value);
        }
        cmd.output()
    })
    .await??;
    Ok(output)
}

async fn requests_grafana() -> anyhow::Result<FakeGrafana> {
    FakeGrafana::builder()
        .api_key("test-key")
        .dashboard(sample_dashboard())
        .datasources(sample_datasources())
        .backend(
            PROMETHEUS_ID,
            Backend::json(prometheus_matrix(&[(
                &[("code", "200")],
                &[(1_620_000_000, "10"), (1_620_000_060, "12")],
            )])),
        )
        .start()
        .await
}

#[tokio::test]
#[serial]
async fn run_once_prints_line_protocol() -> anyhow::Result<()> {
    let grafana = requests_grafana().await?;
    let temp = tempfile::tempdir()?;
    let config = write_config(temp.path(), &grafana.url(), REQUESTS)?;

    let output = grafscrape(
        vec![
            "--config".into(),
            config.display().to_string(),
            "run".into(),
            "--once".into(),
        ],
        Vec::new(),
    )
    .await?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines.iter().all(|l| l.starts_with("grafana,")));
    assert!(lines.iter().all(|l| l.contains(",code=200,") && l.contains(",panel=Requests,")));
    assert!(lines.iter().any(|l| l.ends_with(" requests=20 1620000000000000000")));
    assert!(lines.iter().any(|l| l.ends_with(" requests=24 1620000060000000000")));
    assert_eq!(grafana.proxied().len(), 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn environment_overrides_file_url() -> anyhow::Result<()> {
    let grafana = requests_grafana().await?;
    let temp = tempfile::tempdir()?;
    let config = write_config(temp.path(), "http://127.0.0.1:9", REQUESTS)?;

    let output = grafscrape(
        vec!["run".into(), "--once".into()],
        vec![
            ("GRAFSCRAPE_CONFIG", config.display().to_string()),
            ("GRAFSCRAPE_URL", grafana.url()),
        ],
    )
    .await?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?.lines().count(), 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn run_once_without_metrics_fails() -> anyhow::Result<()> {
    let grafana = requests_grafana().await?;
    let temp = tempfile::tempdir()?;
    let config = write_config(temp.path(), &grafana.url(), "")?;

    let output = grafscrape(
        vec![
            "--config".into(),
            config.display().to_string(),
            "run".into(),
            "--once".into(),
        ],
        Vec::new(),
    )
    .await?;
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(grafana.api_calls().is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn check_lists_metric_definitions() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let config = write_config(
        temp.path(),
        "http://grafana.invalid",
        r#"
[[metrics]]
name = "requests"
interval = "30s"
panels = ["^Requests$", "QPS"]

[[metrics]]
panels = ["^Debug"]
"#,
    )?;

    let output = grafscrape(
        vec!["check".into(), "--config".into(), config.display().to_string()],
        Vec::new(),
    )
    .await?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("url: http://grafana.invalid"));
    assert!(stdout.contains("poll_interval: 30s"));
    let requests = stdout
        .lines()
        .find(|l| l.starts_with("requests"))
        .expect("requests row");
    assert!(requests.contains("30s"));
    assert!(requests.contains("^Requests$ | QPS"));
    assert!(stdout.lines().any(|l| l.starts_with("(skip)")));
    Ok(())
}

#[tokio::test]
#[serial]
async fn missing_explicit_config_is_an_error() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let output = grafscrape(
        vec![
            "check".into(),
            "--config".into(),
            temp.path().join("absent.toml").display().to_string(),
        ],
        Vec::new(),
    )
    .await?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn check_rejects_bad_row_pattern() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let path = temp.path().join("rows.toml");
    std::fs::write(
        &path,
        r#"
url = "http://grafana.invalid"
rows = ["(unclosed"]

[[metrics]]
name = "x"
panels = [".*"]
"#,
    )?;
    let output = grafscrape(
        vec!["check".into(), "--config".into(), path.display().to_string()],
        Vec::new(),
    )
    .await?;
    assert!(!output.status.success());
    Ok(())
}
