use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Top-level configuration, usually read from `opflow.toml`.
///
/// Every section and field is optional; omitted values fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OpflowConfig {
    pub database_path: Option<PathBuf>,
    pub saga: SagaConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SagaConfig {
    pub default_max_attempts: u32,
    pub default_max_compensation_attempts: u32,
    /// Per-attempt wall-clock budget for step and compensation handlers.
    /// `0` disables the timeout.
    pub step_timeout_ms: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_max_compensation_attempts: 3,
            step_timeout_ms: 30_000,
        }
    }
}

impl SagaConfig {
    #[must_use]
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_ms > 0).then(|| Duration::from_millis(self.step_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub max_attempts: u32,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_attempts: 3,
        }
    }
}

impl IdempotencyConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Shortest accepted claim lease. Holders heartbeat every third of the lease,
/// so shorter leases expire between renewals.
pub const MIN_LEASE_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub count: usize,
    pub lease_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            lease_timeout_ms: 60_000,
            poll_interval_ms: 250,
            sweep_interval_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl OpflowConfig {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML, contains unknown keys,
    /// or holds values that cannot drive the engine.
    pub fn from_toml_str(path: &Path, text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(path, &text)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.saga.default_max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "saga.default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.saga.default_max_compensation_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "saga.default_max_compensation_attempts must be at least 1".to_string(),
            ));
        }
        if self.idempotency.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "idempotency.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers.lease_timeout_ms < MIN_LEASE_TIMEOUT_MS {
            return Err(CoreError::InvalidConfig(format!(
                "workers.lease_timeout_ms must be at least {MIN_LEASE_TIMEOUT_MS}"
            )));
        }
        if self.workers.count == 0 {
            return Err(CoreError::InvalidConfig(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CoreError::InvalidConfig(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
