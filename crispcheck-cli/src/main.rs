//! # crispcheck
//!
//! Checks a list of websites for an embedded Crisp chat widget and writes a
//! JSON report, plus an optional `url,status,error` CSV.
//!
//! Targets come from positional arguments and/or a CSV file (the `url`
//! column, else the first one). Settings are read from
//! `$CRISPCHECK_CONFIG_PATH`, `$CRISPCHECK_CONFIG_JSON` or a
//! `crispcheck.toml` in the working directory; command-line flags win.
//!
//! The default `http` backend only fetches documents and scripts: nothing
//! runs and nothing is clicked, so its verdicts approximate a browser's.
//! Build with `--features chromium` and pass `--backend chromium` to render
//! pages in headless Chromium.

mod report;
mod settings;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, bail};
use clap::Parser;
#[cfg(feature = "chromium")]
use crispcheck_core::automation::browser::ChromiumAutomation;
use crispcheck_core::{
    AutomationResource, BatchEvent, CheckConfiguration, TaskOrchestrator, Target,
    automation::http::HttpAutomation,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::{BackendKind, Settings, SettingsSource};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "crispcheck", version)]
#[command(about = "Detect the Crisp chat widget on a batch of websites")]
#[command(after_help = "The http backend does not run scripts or click; its results \
approximate what a browser would see. Use --backend chromium for rendered checks.")]
struct Cli {
    /// URLs to check
    urls: Vec<String>,

    /// CSV of URLs: the `url` column, else the first column (`#` starts a comment)
    #[arg(short, long, env = "CRISPCHECK_INPUT")]
    input: Option<PathBuf>,

    /// Automation backend (overrides settings)
    #[arg(short, long, value_enum, env = "CRISPCHECK_BACKEND")]
    backend: Option<BackendKind>,

    /// Number of sites checked at once (overrides settings)
    #[arg(short, long, env = "CRISPCHECK_JOBS")]
    jobs: Option<usize>,

    /// Navigation bound in milliseconds
    #[arg(long, value_name = "MS")]
    page_timeout: Option<u64>,

    /// Bound on polling for the widget's script globals, in milliseconds
    #[arg(long, value_name = "MS")]
    js_timeout: Option<u64>,

    /// Bound on waiting for network quiescence, in milliseconds
    #[arg(long, value_name = "MS")]
    idle_timeout: Option<u64>,

    /// Bound on clicking a chat button, in milliseconds
    #[arg(long, value_name = "MS")]
    click_timeout: Option<u64>,

    /// Pause after a successful click, in milliseconds
    #[arg(long, value_name = "MS")]
    post_click_wait: Option<u64>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write `url,status,error` rows to this CSV file
    #[arg(short, long, value_name = "FILE")]
    csv_output: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, env = "CRISPCHECK_LOG", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply_overrides(&self, config: &mut CheckConfiguration) {
        if let Some(jobs) = self.jobs {
            config.concurrency_limit = jobs;
        }
        if let Some(ms) = self.page_timeout {
            config.page_load_timeout_ms = ms;
        }
        if let Some(ms) = self.js_timeout {
            config.active_probe_timeout_ms = ms;
        }
        if let Some(ms) = self.idle_timeout {
            config.idle_wait_timeout_ms = ms;
        }
        if let Some(ms) = self.click_timeout {
            config.interaction_timeout_ms = ms;
        }
        if let Some(ms) = self.post_click_wait {
            config.post_interaction_wait_ms = ms;
        }
    }

    fn targets(&self) -> anyhow::Result<Vec<Target>> {
        let mut targets = parse_targets(&self.urls.join("\n"));
        if let Some(path) = &self.input {
            targets.extend(read_targets(path)?);
        }
        Ok(targets)
    }
}

fn read_targets(path: &Path) -> anyhow::Result<Vec<Target>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read targets from {}", path.display()))?;
    parse_target_csv(&raw).with_context(|| format!("invalid target list {}", path.display()))
}

fn parse_targets(raw: &str) -> Vec<Target> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Target::new)
        .collect()
}

/// Reads the `url` column of a CSV, or its first column when none is named
/// `url`. The first row is a header when it names a `url` column or holds
/// nothing that looks like an address; a bare list of URLs works as is.
fn parse_target_csv(raw: &str) -> anyhow::Result<Vec<Target>> {
    let raw = raw.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let mut column = 0;
    let mut targets = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if row == 0 {
            if let Some(named) = record.iter().position(|field| field.eq_ignore_ascii_case("url")) {
                column = named;
                continue;
            }
            if !record.iter().any(looks_like_address) {
                continue;
            }
        }
        match record.get(column) {
            Some(url) if !url.is_empty() && !url.starts_with('#') => targets.push(Target::new(url)),
            _ => {}
        }
    }
    Ok(targets)
}

fn looks_like_address(field: &str) -> bool {
    field.contains("://") || (field.contains('.') && !field.contains(' '))
}

fn init_tracing(level: &str) {
    // Library logs use `probe::*` targets; keep the HTTP stack quiet.
    let fallback = format!("{level},hyper_util=warn,reqwest=warn,rustls=warn");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn log_settings_source(source: &SettingsSource) {
    match source {
        SettingsSource::Default => debug!("no settings file found; using defaults"),
        SettingsSource::EnvPath(path) => {
            info!(path = %path.display(), "settings loaded from env path")
        }
        SettingsSource::EnvInline => info!("settings loaded from inline environment json"),
        SettingsSource::File(path) => info!(path = %path.display(), "settings loaded from file"),
    }
}

/// The automation resource a run borrows, kept concrete so it can be shut
/// down at the end.
enum Backend {
    Http(Arc<HttpAutomation>),
    #[cfg(feature = "chromium")]
    Chromium(Arc<ChromiumAutomation>),
}

impl Backend {
    async fn start(kind: BackendKind, settings: &Settings) -> anyhow::Result<Self> {
        match kind {
            BackendKind::Http => {
                warn!("http backend: scripts are not run and nothing is clicked; results are approximate");
                let automation = HttpAutomation::launch(settings.automation.clone())
                    .context("failed to start the HTTP automation backend")?;
                Ok(Self::Http(Arc::new(automation)))
            }
            #[cfg(feature = "chromium")]
            BackendKind::Chromium => {
                let automation = ChromiumAutomation::launch(settings.chromium.clone())
                    .await
                    .context("failed to launch Chromium")?;
                Ok(Self::Chromium(Arc::new(automation)))
            }
            #[cfg(not(feature = "chromium"))]
            BackendKind::Chromium => {
                bail!("this build has no chromium backend; rebuild with `--features chromium`")
            }
        }
    }

    fn resource(&self) -> Arc<dyn AutomationResource> {
        match self {
            Self::Http(automation) => automation.clone(),
            #[cfg(feature = "chromium")]
            Self::Chromium(automation) => automation.clone(),
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Http(automation) => automation.shutdown(),
            #[cfg(feature = "chromium")]
            Self::Chromium(automation) => automation.shutdown().await,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if env_file_loaded {
        info!("loaded .env file");
    }

    let (mut settings, source) =
        Settings::load_from_env().context("failed to load settings")?;
    log_settings_source(&source);
    cli.apply_overrides(&mut settings.check);
    settings
        .check
        .validate()
        .context("invalid check configuration")?;

    let targets = cli.targets()?;
    if targets.is_empty() {
        bail!("no URLs to check; pass them as arguments or with --input");
    }

    let backend = Backend::start(cli.backend.unwrap_or(settings.backend), &settings).await?;
    let orchestrator = TaskOrchestrator::new(backend.resource());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling remaining checks");
            on_interrupt.cancel();
        }
    });

    info!(
        targets = targets.len(),
        concurrency = settings.check.concurrency_limit,
        "starting batch"
    );
    let started = Instant::now();
    let mut events = orchestrator.run(targets, settings.check, cancel.clone())?;

    let mut report = None;
    while let Some(event) = events.next().await {
        match event {
            BatchEvent::Progress {
                outcome, progress, ..
            } => {
                let diagnostic = outcome.diagnostic_text();
                info!(
                    target: "crispcheck::progress",
                    url = %outcome.target,
                    status = %outcome.classification,
                    percent = progress.percent(),
                    "[{}/{}] {}{}{}",
                    progress.completed_count,
                    progress.total_count,
                    outcome.classification,
                    if diagnostic.is_empty() { "" } else { " - " },
                    diagnostic
                );
            }
            BatchEvent::Completed(done) => report = Some(done),
        }
    }
    backend.shutdown().await;

    let report = report.context("batch ended without a report")?;
    report::write_report(&report, cli.output.as_deref(), &settings.output)?;
    if let Some(path) = &cli.csv_output {
        report::write_csv(&report, path)?;
        info!(path = %path.display(), "results written as csv");
    }

    eprintln!("{}", report.summary());
    eprintln!("Elapsed: {:.2}s", started.elapsed().as_secs_f64());
    if report.cancelled {
        warn!("batch was cancelled before every target ran");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_lists_skip_blanks_and_comments() {
        let raw = "https://a.test\n\n  # staging\n  https://b.test  \n#https://c.test\n";
        let targets = parse_targets(raw);
        let urls: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(urls, vec!["https://a.test", "https://b.test"]);
    }

    #[test]
    fn csv_targets_come_from_the_url_column() {
        let raw = "\u{feff}name,url,notes\nShop, https://shop.test ,x\nBlank,,\nBlog,https://blog.test\n";
        let targets = parse_target_csv(raw).unwrap();
        let urls: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(urls, vec!["https://shop.test", "https://blog.test"]);
    }

    #[test]
    fn csv_without_url_column_uses_the_first_one() {
        let raw = "website,owner\nhttps://a.test,ann\nb.test,bob\n";
        let targets = parse_target_csv(raw).unwrap();
        let urls: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(urls, vec!["https://a.test", "b.test"]);
    }

    #[test]
    fn headerless_url_lists_keep_every_row() {
        let raw = "https://a.test\n\n# staging\n  https://b.test  \n";
        let targets = parse_target_csv(raw).unwrap();
        let urls: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(urls, vec!["https://a.test", "https://b.test"]);
    }

    #[test]
    fn backend_and_csv_output_flags_parse() {
        let cli = Cli::parse_from([
            "crispcheck",
            "--backend",
            "chromium",
            "--csv-output",
            "out.csv",
            "https://a.test",
        ]);
        assert_eq!(cli.backend, Some(BackendKind::Chromium));
        assert_eq!(cli.csv_output, Some(PathBuf::from("out.csv")));
        assert_eq!(Cli::parse_from(["crispcheck"]).backend, None);
    }

    #[cfg(not(feature = "chromium"))]
    #[tokio::test]
    async fn chromium_backend_needs_the_feature() {
        let result = Backend::start(BackendKind::Chromium, &Settings::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn arguments_come_before_file_targets() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sites.csv");
        fs::write(&file, "url\nhttps://file.test\n").unwrap();

        let cli = Cli::parse_from([
            "crispcheck",
            "https://arg.test",
            "--input",
            file.to_str().unwrap(),
        ]);
        let targets = cli.targets().unwrap();
        let urls: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(urls, vec!["https://arg.test", "https://file.test"]);
    }

    #[test]
    fn flags_override_loaded_settings() {
        let cli = Cli::parse_from([
            "crispcheck",
            "-j",
            "2",
            "--page-timeout",
            "1000",
            "--js-timeout",
            "2000",
            "--idle-timeout",
            "3000",
            "--click-timeout",
            "400",
            "--post-click-wait",
            "50",
        ]);
        let mut config = CheckConfiguration::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.page_load_timeout_ms, 1000);
        assert_eq!(config.active_probe_timeout_ms, 2000);
        assert_eq!(config.idle_wait_timeout_ms, 3000);
        assert_eq!(config.interaction_timeout_ms, 400);
        assert_eq!(config.post_interaction_wait_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_jobs_is_rejected_by_validation() {
        let cli = Cli::parse_from(["crispcheck", "--jobs", "0", "https://a.test"]);
        let mut config = CheckConfiguration::default();
        cli.apply_overrides(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unset_flags_keep_loaded_values() {
        let cli = Cli::parse_from(["crispcheck", "https://a.test"]);
        let mut config = CheckConfiguration {
            page_load_timeout_ms: 42_000,
            ..CheckConfiguration::default()
        };
        cli.apply_overrides(&mut config);
        assert_eq!(config.page_load_timeout_ms, 42_000);
        assert_eq!(config.interaction_timeout_ms, 5_000);
    }
}
