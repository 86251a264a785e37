//! Configuration management for Callgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{CallgateError, Result};
use crate::gate::{RateLimitConfig, ReleasePolicy, TimeUnit};

/// Main configuration file for a Callgate deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallgateConfig {
    /// Admission gate configuration
    #[serde(default)]
    pub gate: GateSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limits for the admission gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSection {
    /// Maximum admissions per window. Signed so that negative values can be
    /// reported as invalid rather than as a parse failure.
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Window length as one unit of time
    #[serde(default = "default_unit")]
    pub unit: TimeUnit,

    /// Window length in milliseconds; overrides `unit` when set
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// When admitted calls give their slot back
    #[serde(default)]
    pub release: ReleasePolicy,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            unit: default_unit(),
            window_ms: None,
            release: ReleasePolicy::default(),
        }
    }
}

fn default_limit() -> i64 {
    10
}

fn default_unit() -> TimeUnit {
    TimeUnit::Second
}

impl GateSection {
    /// Effective window length.
    pub fn window(&self) -> Duration {
        match self.window_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.unit.duration(),
        }
    }

    /// Validate and convert into the gate's limits.
    pub fn to_rate_limit_config(&self) -> Result<RateLimitConfig> {
        let limit = u64::try_from(self.limit).map_err(|_| {
            CallgateError::InvalidConfig(format!(
                "limit must be greater than 0, got {}",
                self.limit
            ))
        })?;

        Ok(RateLimitConfig::new(self.window(), limit)?.with_release(self.release))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level filter (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
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

impl CallgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CallgateError::Config(format!("Failed to parse gate config: {}", e)))
    }
}
