//! Runtime configuration loaded from YAML and the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_POLL_INTERVAL_SECS: &str = "TOOLFLOW_POLL_INTERVAL_SECS";
pub const ENV_HISTORY_CAPACITY: &str = "TOOLFLOW_HISTORY_CAPACITY";
pub const ENV_MAX_PARALLEL_STEPS: &str = "TOOLFLOW_MAX_PARALLEL_STEPS";
pub const ENV_MAX_RETRY_ATTEMPTS: &str = "TOOLFLOW_MAX_RETRY_ATTEMPTS";
pub const ENV_DEFAULT_STEP_TIMEOUT_MS: &str = "TOOLFLOW_DEFAULT_STEP_TIMEOUT_MS";

/// Errors raised while loading configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    /// A setting is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration for orchestration, scheduling and monitoring.
///
/// Every field has a default, so an empty YAML document is a valid
/// configuration. Durations are written in milliseconds:
///
/// ```yaml
/// scheduler_poll_interval_ms: 60000
/// history_capacity: 100
/// max_parallel_steps: 8
/// max_retry_attempts: 10
/// default_step_timeout_ms: 30000
/// finished_status_capacity: 256
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Period of the recurring-schedule poll loop
    #[serde(rename = "scheduler_poll_interval_ms", with = "toolflow_core::duration_ms")]
    pub scheduler_poll_interval: Duration,
    /// Execution records retained per workflow id
    pub history_capacity: usize,
    /// Parallel steps allowed to run at once within one execution
    pub max_parallel_steps: usize,
    /// Cap applied to every step's retry attempts
    pub max_retry_attempts: u32,
    /// Timeout for steps that declare none
    #[serde(
        rename = "default_step_timeout_ms",
        with = "toolflow_core::duration_ms::option"
    )]
    pub default_step_timeout: Option<Duration>,
    /// Finished statuses kept for polling after a run ends
    pub finished_status_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler_poll_interval: Duration::from_secs(60),
            history_capacity: 100,
            max_parallel_steps: 8,
            max_retry_attempts: 10,
            default_step_timeout: None,
            finished_status_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Applies `TOOLFLOW_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// `with_env_overrides` is this with `std::env::var` as the lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_override::<u64>(&lookup, ENV_POLL_INTERVAL_SECS)? {
            self.scheduler_poll_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_override(&lookup, ENV_HISTORY_CAPACITY)? {
            self.history_capacity = capacity;
        }
        if let Some(max) = parse_override(&lookup, ENV_MAX_PARALLEL_STEPS)? {
            self.max_parallel_steps = max;
        }
        if let Some(max) = parse_override(&lookup, ENV_MAX_RETRY_ATTEMPTS)? {
            self.max_retry_attempts = max;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_DEFAULT_STEP_TIMEOUT_MS)? {
            self.default_step_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects settings that would stall the runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler_poll_interval must be positive".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_parallel_steps == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_steps must be at least 1".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
