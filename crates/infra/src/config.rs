//! Loader subsystem configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use loadcache_core::LoadType;

use crate::error::LoadError;
use crate::retry::RetryOverride;

/// Longest accepted retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Recognized options and their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Executions allowed before a task fails with `RetriesExhausted`.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Jitter factor (0.0-1.0) applied to retry delays.
    pub backoff_jitter: f64,
    /// Period of the retry sweeper.
    pub sweep_interval: Duration,
    /// Max due tasks claimed per sweep run.
    pub sweep_batch_size: usize,
    /// Partitions per topic; one consumer thread per partition.
    pub partition_count: u32,
    /// Namespace prefix for topic names.
    pub topic_prefix: String,
    pub enable_workers: bool,
    pub enable_notifications: bool,
    pub enable_retry_sweeper: bool,
    pub retry_overrides: HashMap<LoadType, RetryOverride>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.0,
            sweep_interval: Duration::from_millis(30_000),
            sweep_batch_size: 100,
            partition_count: 4,
            topic_prefix: String::new(),
            enable_workers: true,
            enable_notifications: true,
            enable_retry_sweeper: true,
            retry_overrides: HashMap::new(),
        }
    }
}

impl LoaderConfig {
    /// Read `LOADER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`LoaderConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, name, default.as_millis() as u64))
        };

        Self {
            max_attempts: parse_or(&lookup, "LOADER_MAX_ATTEMPTS", d.max_attempts),
            backoff_base: ms("LOADER_BACKOFF_BASE_MS", d.backoff_base),
            backoff_max: ms("LOADER_BACKOFF_MAX_MS", d.backoff_max),
            backoff_jitter: parse_or(&lookup, "LOADER_BACKOFF_JITTER", d.backoff_jitter),
            sweep_interval: ms("LOADER_SWEEP_INTERVAL_MS", d.sweep_interval),
            sweep_batch_size: parse_or(&lookup, "LOADER_SWEEP_BATCH_SIZE", d.sweep_batch_size),
            partition_count: parse_or(&lookup, "LOADER_PARTITION_COUNT", d.partition_count),
            topic_prefix: lookup("LOADER_TOPIC_PREFIX").unwrap_or(d.topic_prefix),
            enable_workers: parse_flag(&lookup, "LOADER_ENABLE_WORKERS", d.enable_workers),
            enable_notifications: parse_flag(
                &lookup,
                "LOADER_ENABLE_NOTIFICATIONS",
                d.enable_notifications,
            ),
            enable_retry_sweeper: parse_flag(&lookup, "LOADER_ENABLE_RETRY", d.enable_retry_sweeper),
            retry_overrides: d.retry_overrides,
        }
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.max_attempts == 0 {
            return Err(LoadError::Config("max_attempts must be at least 1".into()));
        }
        if self.partition_count == 0 {
            return Err(LoadError::Config("partition_count must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(LoadError::Config("sweep_interval must be positive".into()));
        }
        if self.sweep_batch_size == 0 {
            return Err(LoadError::Config("sweep_batch_size must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(LoadError::Config(
                "backoff_base must not exceed backoff_max".into(),
            ));
        }
        if self.backoff_max > MAX_BACKOFF {
            return Err(LoadError::Config(format!(
                "backoff_max must not exceed {}s",
                MAX_BACKOFF.as_secs()
            )));
        }
        for (load_type, o) in &self.retry_overrides {
            if o.max_attempts == Some(0) {
                return Err(LoadError::Config(format!(
                    "retry override for {load_type}: max_attempts must be at least 1"
                )));
            }
            if o.backoff_base.into_iter().chain(o.backoff_max).any(|d| d > MAX_BACKOFF) {
                return Err(LoadError::Config(format!(
                    "retry override for {load_type}: backoff must not exceed {}s",
                    MAX_BACKOFF.as_secs()
                )));
            }
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + core::fmt::Debug,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, default = ?default, "invalid value; using default");
            default
        }),
        None => default,
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name).as_deref().map(str::trim) {
        Some("1" | "true" | "TRUE" | "yes") => true,
        Some("0" | "false" | "FALSE" | "no") => false,
        Some(other) => {
            warn!(variable = name, value = %other, default, "invalid flag; using default");
            default
        }
        None => default,
    }
}
