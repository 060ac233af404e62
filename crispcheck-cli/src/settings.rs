use anyhow::{Context, anyhow};
use clap::ValueEnum;
#[cfg(feature = "chromium")]
use crispcheck_core::automation::browser::ChromiumAutomationOptions;
use crispcheck_core::{CheckConfiguration, automation::http::HttpAutomationOptions};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const CONFIG_PATH_ENV: &str = "CRISPCHECK_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "CRISPCHECK_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &["crispcheck.toml", "crispcheck.json", "config/crispcheck.toml"];

/// Where the settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything the binary reads before starting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Per-batch timeouts and pool size. CLI flags override these.
    pub check: CheckConfiguration,
    pub backend: BackendKind,
    /// HTTP client used to fetch pages and their scripts.
    pub automation: HttpAutomationOptions,
    /// Browser launch options for the `chromium` backend.
    #[cfg(feature = "chromium")]
    pub chromium: ChromiumAutomationOptions,
    pub output: OutputSettings,
}

/// Which automation backend drives the pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Fetch documents and scripts over HTTP. Scripts never run and nothing
    /// is clicked, so widget globals are inferred from script text.
    #[default]
    Http,
    /// Render pages in headless Chromium (needs the `chromium` feature).
    Chromium,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Pretty-print the JSON report.
    pub pretty: bool,
    /// Embed each target's stage trace in the report.
    pub include_trace: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            pretty: true,
            include_trace: false,
        }
    }
}

impl Settings {
    /// Load settings using environment variables.
    /// Evaluation order:
    /// 1) `$CRISPCHECK_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$CRISPCHECK_CONFIG_JSON` (inline JSON),
    /// 3) the first default file found in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, SettingsSource)> {
        Self::load_with(|key| env::var(key).ok(), Path::new("."))
    }

    /// Same as [`Settings::load_from_env`] with an explicit variable lookup
    /// and base directory for default files.
    pub fn load_with(
        lookup: impl Fn(&str) -> Option<String>,
        base_dir: &Path,
    ) -> anyhow::Result<(Self, SettingsSource)> {
        if let Some(path_str) = lookup(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str.trim());
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, SettingsSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, SettingsSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(base_dir) {
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        Ok((Self::default(), SettingsSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                Self::parse_json(&contents).with_context(|| format!("invalid settings {}", path.display()))
            }
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid settings {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse settings {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid settings json: {err}"))
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.is_file())
    }
}
