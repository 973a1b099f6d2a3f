//! TOML configuration for the results service.
//!
//! Layered lookup: an explicit path, then the `SBTET_RESULTS_CONFIG`
//! environment variable, then `/etc/sbtet-results/config.toml`, then the
//! compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fetch::RetryPolicy;
use crate::jobs::Pacing;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV_VAR: &str = "SBTET_RESULTS_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/sbtet-results/config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration.
    ///
    /// An explicit `path` must load; the environment and system locations
    /// fall through to defaults when missing or broken.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV_VAR} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject settings that would make the service unusable.
    pub fn validate(&self) -> Result<()> {
        if self.scraper.base_url.trim().is_empty() {
            bail!("scraper.base_url must not be empty");
        }
        if reqwest::Url::parse(&self.scraper.base_url).is_err() {
            bail!("scraper.base_url is not a valid URL: {}", self.scraper.base_url);
        }
        if self.scraper.max_concurrent_requests == 0 {
            bail!("scraper.max_concurrent_requests must be at least 1");
        }
        if self.scraper.max_retries == 0 {
            bail!("scraper.max_retries must be at least 1");
        }
        if self.scraper.request_timeout_secs == 0 {
            bail!("scraper.request_timeout_secs must be at least 1");
        }
        if self.limits.max_pins_per_job == 0 {
            bail!("limits.max_pins_per_job must be at least 1");
        }
        Ok(())
    }

    /// Replace the port of `server.bind`, keeping its host.
    pub fn override_port(&mut self, port: u16) {
        let host = self
            .server
            .bind
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.server.bind = format!("{host}:{port}");
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener and artifact storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Directory generated spreadsheets are written to.
    pub artifact_dir: PathBuf,
    /// Origins allowed to call the API from a browser.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            artifact_dir: PathBuf::from("data/reports"),
            cors_origins: vec!["https://mydiplomaclassresults.onrender.com".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// Remote results site and request pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Results page hosting the lookup form.
    pub base_url: String,
    /// PIN requests in flight at once for a single job.
    pub max_concurrent_requests: usize,
    /// Per-attempt timeout (seconds).
    pub request_timeout_secs: u64,
    /// Total attempts per PIN, including the first.
    pub max_retries: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
    /// PINs dispatched per batch; 0 sends the whole range as one batch.
    pub batch_size: usize,
    /// Pause between batches (milliseconds).
    pub batch_delay_ms: u64,
    pub user_agent: String,
}

impl ScraperConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            batch_size: self.batch_size,
            batch_delay: Duration::from_millis(self.batch_delay_ms),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sbtet.ap.gov.in/APSBTET/results.do".to_string(),
            max_concurrent_requests: 2,
            request_timeout_secs: 15,
            max_retries: 2,
            retry_delay_ms: 500,
            batch_size: 10,
            batch_delay_ms: 500,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Admission limits for job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest PIN range a single job may cover.
    pub max_pins_per_job: u32,
    /// Pending plus in-progress jobs allowed at once.
    pub max_active_jobs: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pins_per_job: 200,
            max_active_jobs: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
