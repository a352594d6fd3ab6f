//! Configuration management for the mixer client.
//!
//! Configuration is assembled from three sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! Environment variables take precedence over file values, which take
//! precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use mixer_client::config::MixerConfig;
//!
//! // Load from file with env overrides
//! let config = MixerConfig::load("mixer.yaml")?;
//!
//! // Or load from environment only
//! let config = MixerConfig::from_env()?;
//! let options = config.to_options();
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use mixer_domain::{CheckOptions, MixerClientOptions, QuotaOptions, ReportOptions};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::observability::LoggingConfig;

const ENV_PREFIX: &str = "MIXER";

/// Mixer client configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MixerConfig {
    /// Check cache settings
    #[serde(default)]
    pub check: CheckSettings,

    /// Report batching settings
    #[serde(default)]
    pub report: ReportSettings,

    /// Quota cache settings
    #[serde(default)]
    pub quota: QuotaSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Deadline hint passed to the transport, in milliseconds. Zero disables it.
    #[serde(default)]
    pub deadline_hint_ms: u64,
}

/// Check cache settings.
///
/// Environment variables: `MIXER_CHECK__CACHE_CAPACITY`,
/// `MIXER_CHECK__TTL_MS`, `MIXER_CHECK__AMORTIZATION_LIMIT`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CheckSettings {
    /// Maximum cached decisions; 0 disables the cache
    #[serde(default = "default_check_capacity")]
    pub cache_capacity: u64,

    /// Default decision lifetime in milliseconds
    #[serde(default = "default_check_ttl_ms")]
    pub ttl_ms: u64,

    /// Local approvals per decision before revalidation
    #[serde(default = "default_amortization_limit")]
    pub amortization_limit: u32,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            cache_capacity: default_check_capacity(),
            ttl_ms: default_check_ttl_ms(),
            amortization_limit: default_amortization_limit(),
        }
    }
}

fn default_check_capacity() -> u64 {
    10_000
}

fn default_check_ttl_ms() -> u64 {
    10_000
}

fn default_amortization_limit() -> u32 {
    100
}

/// Report batching settings.
///
/// # Example YAML Configuration
///
/// ```yaml
/// report:
///   max_batch_entries: 1000
///   max_batch_age_ms: 1000
///   max_buffer_bytes: 1048576
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReportSettings {
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,

    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            max_batch_entries: default_max_batch_entries(),
            max_batch_age_ms: default_max_batch_age_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

fn default_max_batch_entries() -> usize {
    1_000
}

fn default_max_batch_age_ms() -> u64 {
    1_000
}

fn default_max_buffer_bytes() -> usize {
    1024 * 1024
}

/// Quota cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct QuotaSettings {
    /// Maximum quota keys held locally
    #[serde(default = "default_quota_capacity")]
    pub cache_capacity: usize,

    /// Minimum amount requested per network allocation
    #[serde(default = "default_prefetch_amount")]
    pub prefetch_amount: i64,

    /// Balance below which a background refill starts
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: i64,

    /// Grant lifetime in milliseconds when the server does not set one
    #[serde(default = "default_quota_ttl_ms")]
    pub ttl_ms: u64,

    /// Grant optimistically when the local balance is short
    #[serde(default)]
    pub best_effort: bool,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            cache_capacity: default_quota_capacity(),
            prefetch_amount: default_prefetch_amount(),
            low_water_mark: default_low_water_mark(),
            ttl_ms: default_quota_ttl_ms(),
            best_effort: false,
        }
    }
}

fn default_quota_capacity() -> usize {
    10_000
}

fn default_prefetch_amount() -> i64 {
    100
}

fn default_low_water_mark() -> i64 {
    10
}

fn default_quota_ttl_ms() -> u64 {
    60_000
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl MixerConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `MIXER_` and use `__` as the
    /// nested key separator, e.g. `MIXER_CHECK__TTL_MS=500` overrides
    /// `check.ttl_ms`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&MixerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(env_source())
            .build()?;

        let mixer_config: MixerConfig = config.try_deserialize()?;
        mixer_config.validate()?;

        Ok(mixer_config)
    }

    /// Load configuration from defaults and `MIXER_` environment variables.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&MixerConfig::default())?)
            .add_source(env_source())
            .build()?;

        let mixer_config: MixerConfig = config.try_deserialize()?;
        mixer_config.validate()?;

        Ok(mixer_config)
    }

    /// Validate option ranges and the log level.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        self.to_options()
            .validate()
            .map_err(|err| ConfigLoadError::Invalid {
                message: match err {
                    mixer_domain::MixerError::Configuration { message } => message,
                    other => other.to_string(),
                },
            })?;

        if Level::from_str(&self.logging.level).is_err() {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: [\"trace\", \"debug\", \"info\", \"warn\", \"error\"], got: {}",
                    self.logging.level
                ),
            });
        }

        Ok(())
    }

    /// Builds the client options described by this configuration.
    pub fn to_options(&self) -> MixerClientOptions {
        let check = CheckOptions::default()
            .with_cache_capacity(self.check.cache_capacity)
            .with_ttl(Duration::from_millis(self.check.ttl_ms))
            .with_amortization_limit(self.check.amortization_limit);
        let report = ReportOptions::default()
            .with_max_batch_entries(self.report.max_batch_entries)
            .with_max_batch_age(Duration::from_millis(self.report.max_batch_age_ms))
            .with_max_buffer_bytes(self.report.max_buffer_bytes);
        let quota = QuotaOptions::default()
            .with_cache_capacity(self.quota.cache_capacity)
            .with_prefetch_amount(self.quota.prefetch_amount)
            .with_low_water_mark(self.quota.low_water_mark)
            .with_ttl(Duration::from_millis(self.quota.ttl_ms))
            .with_best_effort(self.quota.best_effort);

        let options = MixerClientOptions::new(check, report, quota);
        match self.deadline_hint_ms {
            0 => options,
            ms => options.with_deadline_hint(Duration::from_millis(ms)),
        }
    }

    /// Builds the logging configuration. An unparseable level falls back to INFO.
    pub fn logging_config(&self) -> LoggingConfig {
        let level = Level::from_str(&self.logging.level).unwrap_or(Level::INFO);
        LoggingConfig::new(level, self.logging.json)
    }
}

// Use __ as separator for nested keys: MIXER_CHECK__TTL_MS -> check.ttl_ms
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}
