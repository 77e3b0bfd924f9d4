use std::path::{Path, PathBuf};

use anyhow::Context as _;
use courier_common::error::ConfigError;
use courier_delivery::{
    BatchConfig, FilterConfig, RateLimitConfig, ServiceConfig, SmtpConfig, SmtpTimeouts,
    TemplateConfig,
};
use courier_metrics::MetricsConfig;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

/// Everything the daemon reads from its RON file. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub timeouts: SmtpTimeouts,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Parses a configuration from RON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        ron::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Reads and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.smtp.validate()?;

        if let Some(tier) = self
            .rate_limits
            .limits
            .iter()
            .find(|(_, limit)| limit.window_secs == 0)
            .map(|(tier, _)| tier)
        {
            return Err(ConfigError::invalid(
                format!("rate_limits.limits.{}.window_secs", tier.as_str()),
                "must be greater than zero",
            ));
        }

        let positive = [
            ("batch.interval_secs", self.batch.interval_secs),
            ("service.delivery_timeout_secs", self.service.delivery_timeout_secs),
            ("service.scheduler_interval_secs", self.service.scheduler_interval_secs),
            ("filter.retention_secs", self.filter.retention_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(*field, "must be greater than zero"));
        }

        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                "batch.max_batch_size",
                "must be greater than zero",
            ));
        }
        if self.filter.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "filter.history_capacity",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Finds the configuration file using the following precedence:
/// 1. `explicit`, from the command line
/// 2. the `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron
/// 4. /etc/courier/courier.config.ron
///
/// # Errors
///
/// Returns an error if an explicitly named file does not exist, or nothing was
/// found.
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(
            path.exists(),
            "--config points to non-existent file: {}",
            path.display()
        );
        return Ok(path);
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        anyhow::ensure!(
            path.exists(),
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
        return Ok(path);
    }

    if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|path| path.exists()) {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|path| format!("  - {path}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
