use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mcf_extract::ExtractorConfig;
use mcf_storage::{default_user_agents, HttpClientConfig, RetryPolicy, MAX_REDIRECTS};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "mcf.yaml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/listings.db";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub database_url: String,
    /// Fixed pause between sources.
    pub delay: Duration,
    /// Upper bound of the random pause added to `delay`.
    pub jitter: Duration,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub user_agents: Vec<String>,
    pub extractor: ExtractorConfig,
    pub extract_posts: bool,
    pub reconcile_removed: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            delay: Duration::from_millis(1500),
            jitter: Duration::from_millis(500),
            http_timeout_secs: 30,
            max_retries: RetryPolicy::default().max_retries,
            user_agents: default_user_agents(),
            extractor: ExtractorConfig::default(),
            extract_posts: true,
            reconcile_removed: false,
            scheduler_enabled: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    scraping: ScrapingSection,
    anthropic_api_key: Option<String>,
    openai_api_key: Option<String>,
    anthropic_model: Option<String>,
    openai_model: Option<String>,
    extract_posts: Option<bool>,
    reconcile_removed: Option<bool>,
    scheduler_enabled: Option<bool>,
    sync_cron: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ScrapingSection {
    delay_seconds: Option<f64>,
    jitter_seconds: Option<f64>,
    timeout_seconds: Option<u64>,
    max_retries: Option<usize>,
    user_agents: Option<Vec<String>>,
}

impl SyncConfig {
    /// Defaults, then the YAML file (`MCF_CONFIG` or `./mcf.yaml` when present), then the
    /// environment.
    pub fn from_env() -> Result<Self> {
        let path = match std::env::var("MCF_CONFIG") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(text)?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(url) = file.database_url {
            self.database_url = url;
        }
        if let Some(secs) = file.scraping.delay_seconds {
            set_secs(&mut self.delay, secs, "scraping.delay_seconds");
        }
        if let Some(secs) = file.scraping.jitter_seconds {
            set_secs(&mut self.jitter, secs, "scraping.jitter_seconds");
        }
        if let Some(secs) = file.scraping.timeout_seconds {
            self.http_timeout_secs = secs;
        }
        if let Some(retries) = file.scraping.max_retries {
            self.max_retries = retries;
        }
        if let Some(agents) = file.scraping.user_agents {
            self.user_agents = agents;
        }
        if file.anthropic_api_key.is_some() {
            self.extractor.anthropic_api_key = file.anthropic_api_key;
        }
        if file.openai_api_key.is_some() {
            self.extractor.openai_api_key = file.openai_api_key;
        }
        if let Some(model) = file.anthropic_model {
            self.extractor.anthropic_model = model;
        }
        if let Some(model) = file.openai_model {
            self.extractor.openai_model = model;
        }
        if let Some(flag) = file.extract_posts {
            self.extract_posts = flag;
        }
        if let Some(flag) = file.reconcile_removed {
            self.reconcile_removed = flag;
        }
        if let Some(flag) = file.scheduler_enabled {
            self.scheduler_enabled = flag;
        }
        if let Some(cron) = file.sync_cron {
            self.sync_cron = cron;
        }
    }

    /// Overlay environment variables read through `lookup`. Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "MCF_DELAY_SECS") {
            set_secs(&mut self.delay, secs, "MCF_DELAY_SECS");
        }
        if let Some(secs) = parse_var(&lookup, "MCF_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs;
        }
        if let Some(retries) = parse_var(&lookup, "MCF_MAX_RETRIES") {
            self.max_retries = retries;
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.extractor.anthropic_api_key = Some(key);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.extractor.openai_api_key = Some(key);
        }
        if let Some(flag) = lookup("MCF_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(cron) = lookup("MCF_SYNC_CRON") {
            self.sync_cron = cron;
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agents: self.user_agents.clone(),
            max_redirects: MAX_REDIRECTS,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
        }
    }

    /// `delay` plus a uniformly random share of `jitter`.
    pub fn pause_between_sources(&self) -> Duration {
        self.delay + self.jitter.mul_f64(fastrand::f64())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn set_secs(target: &mut Duration, secs: f64, key: &str) {
    match Duration::try_from_secs_f64(secs) {
        Ok(value) => *target = value,
        Err(_) => warn!(key, secs, "ignoring invalid duration"),
    }
}
