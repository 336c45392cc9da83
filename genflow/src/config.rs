//! Engine configuration.
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a usable configuration. Environment variables override file values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{GenflowError, Result};
use crate::observability::LogFormat;
use crate::retry::{BackoffPolicy, PassDelayBasis, RetryPolicy};

/// Top-level configuration for an orchestration context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Concurrency limits.
    #[serde(default)]
    pub engine: ConcurrencyConfig,
    /// Handoff store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Retry policy for single-shot stages.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Batch stage settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Polling settings for job-style batch stages.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Process-wide concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent external calls across every running pipeline.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// How long a finished job stays queryable in the registry, in seconds.
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_job_retention() -> u64 {
    300
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            shutdown_grace_secs: default_shutdown_grace(),
            job_retention_secs: default_job_retention(),
        }
    }
}

impl ConcurrencyConfig {
    /// Returns the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Returns the finished-job retention window.
    #[must_use]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

/// Longest TTL accepted for any stored entry: 30 days.
pub const MAX_TTL_SECS: u64 = 30 * 86_400;

/// Handoff store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Backend URL. `memory://` selects the in-process backend.
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Key prefix applied by networked backends.
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// TTL applied when a write does not name one, in seconds.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    /// TTL for persisted task results, in seconds.
    #[serde(default = "default_task_result_ttl")]
    pub task_result_ttl_secs: u64,
    /// Keys requested per SCAN batch during pattern deletion.
    #[serde(default = "default_scan_batch")]
    pub scan_batch_size: usize,
}

fn default_store_url() -> String {
    "memory://".to_string()
}

fn default_ttl() -> u64 {
    3600
}

fn default_task_result_ttl() -> u64 {
    86_400
}

fn default_scan_batch() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: None,
            default_ttl_secs: default_ttl(),
            task_result_ttl_secs: default_task_result_ttl(),
            scan_batch_size: default_scan_batch(),
        }
    }
}

impl StoreConfig {
    /// Default TTL as a duration.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Task result TTL as a duration.
    #[must_use]
    pub fn task_result_ttl(&self) -> Duration {
        Duration::from_secs(self.task_result_ttl_secs)
    }
}

/// Settings shared by batch stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchConfig {
    /// Per-item retry budget.
    #[serde(default = "default_batch_retries")]
    pub max_retries: u32,
    /// Base delay between passes, in milliseconds.
    #[serde(default = "default_pass_delay_ms")]
    pub pass_delay_ms: u64,
    /// Upper bound for the inter-pass delay, in milliseconds.
    #[serde(default = "default_max_pass_delay_ms")]
    pub max_pass_delay_ms: u64,
    /// Backoff curve between passes.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Which pending item drives the inter-pass delay.
    #[serde(default)]
    pub delay_basis: PassDelayBasis,
    /// TTL of batch checkpoints, in seconds.
    #[serde(default = "default_checkpoint_ttl")]
    pub checkpoint_ttl_secs: u64,
}

fn default_batch_retries() -> u32 {
    3
}

fn default_pass_delay_ms() -> u64 {
    2000
}

fn default_max_pass_delay_ms() -> u64 {
    60_000
}

fn default_checkpoint_ttl() -> u64 {
    86_400
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_batch_retries(),
            pass_delay_ms: default_pass_delay_ms(),
            max_pass_delay_ms: default_max_pass_delay_ms(),
            backoff: BackoffPolicy::default(),
            delay_basis: PassDelayBasis::default(),
            checkpoint_ttl_secs: default_checkpoint_ttl(),
        }
    }
}

impl BatchConfig {
    /// Builds the retry policy used to space batch passes.
    #[must_use]
    pub fn pass_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_retries.max(1))
            .with_base_delay_ms(self.pass_delay_ms)
            .with_max_delay_ms(self.max_pass_delay_ms)
            .with_backoff(self.backoff)
    }

    /// Checkpoint TTL as a duration.
    #[must_use]
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }
}

/// Settings for the submit/poll/timeout protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingConfig {
    /// Interval between status sweeps, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Wall-clock budget for one pass, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_poll_timeout() -> u64 {
    600
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

impl PollingConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Pass timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| GenflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file, then applies environment overrides.
    ///
    /// A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(err) => {
                return Err(GenflowError::Config(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `GENFLOW_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GENFLOW_MAX_CONCURRENCY") {
            self.engine.max_concurrency = parse_env("GENFLOW_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("GENFLOW_STORE_URL") {
            self.store.url = value;
        }
        if let Some(value) = lookup("GENFLOW_DEFAULT_TTL_SECS") {
            self.store.default_ttl_secs = parse_env("GENFLOW_DEFAULT_TTL_SECS", &value)?;
        }
        if let Some(value) = lookup("GENFLOW_LOG_FORMAT") {
            self.log_format = value
                .parse()
                .map_err(|e: String| GenflowError::Config(format!("GENFLOW_LOG_FORMAT: {e}")))?;
        }
        Ok(())
    }

    /// Rejects settings that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(GenflowError::Config(
                "engine.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GenflowError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.scan_batch_size == 0 {
            return Err(GenflowError::Config(
                "store.scan_batch_size must be at least 1".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(GenflowError::Config(
                "polling.interval_ms must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("store.default_ttl_secs", self.store.default_ttl_secs),
            ("store.task_result_ttl_secs", self.store.task_result_ttl_secs),
            ("batch.checkpoint_ttl_secs", self.batch.checkpoint_ttl_secs),
        ] {
            if secs == 0 || secs > MAX_TTL_SECS {
                return Err(GenflowError::Config(format!(
                    "{name} must be between 1 and {MAX_TTL_SECS}, got {secs}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GenflowError::Config(format!("{name}={value:?}: {e}")))
}
