//! Typed configuration.
//!
//! Scheduler settings are fixed at construction. They come from defaults,
//! an optional TOML file, and environment overrides, in that order.
//! Loads once at startup and fails fast on malformed values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a failed item with attempts left goes back into its lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPlacement {
    /// Keep the original position: retried before younger items.
    #[default]
    Head,
    /// Move behind everything already in the lane.
    Tail,
}

/// Which items an eviction sweep removes by age.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Completed items, plus anything older than the max age whatever its
    /// status. Unresolved work can be dropped this way.
    #[default]
    AnyStatus,
    /// Completed items only. Pending, processing and failed items stay
    /// until acknowledged.
    CompletedOnly,
}

/// Scheduler-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Per-lane cap on items in `processing`.
    pub max_concurrent: usize,
    pub default_timeout_ms: u64,
    pub default_max_attempts: u32,
    pub eviction_max_age_ms: u64,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub retry_placement: RetryPlacement,
    pub eviction_policy: EvictionPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_timeout_ms: 30_000,
            default_max_attempts: 3,
            eviction_max_age_ms: 24 * 60 * 60 * 1000,
            event_capacity: 1024,
            retry_placement: RetryPlacement::Head,
            eviction_policy: EvictionPolicy::AnyStatus,
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("bad scheduler config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(Error::Config(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(Error::Config("default_timeout_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn eviction_max_age(&self) -> Duration {
        Duration::from_millis(self.eviction_max_age_ms)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Other(format!("serialize config: {e}")))
    }
}

/// Process configuration.
#[derive(Debug)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `LANEQ_CONFIG` names an optional TOML file; the individual
    /// `LANEQ_*` variables override whatever it sets.
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut scheduler = match std::env::var("LANEQ_CONFIG") {
            Ok(path) => SchedulerConfig::load(Path::new(&path))?,
            Err(_) => SchedulerConfig::default(),
        };

        if let Some(v) = parsed_var("LANEQ_MAX_CONCURRENT")? {
            scheduler.max_concurrent = v;
        }
        if let Some(v) = parsed_var("LANEQ_DEFAULT_TIMEOUT_MS")? {
            scheduler.default_timeout_ms = v;
        }
        if let Some(v) = parsed_var("LANEQ_DEFAULT_MAX_ATTEMPTS")? {
            scheduler.default_max_attempts = v;
        }
        if let Some(v) = parsed_var("LANEQ_EVICTION_MAX_AGE_MS")? {
            scheduler.eviction_max_age_ms = v;
        }
        scheduler.validate()?;

        Ok(Self {
            scheduler,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
