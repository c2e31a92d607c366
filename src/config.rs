//! Pool configuration.
//!
//! Limits and timeouts are supplied once at pool creation and are immutable
//! afterwards. The struct is plain serde data so deployments can load it from
//! a JSON document next to the dialect tables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::IsolationLevel;

pub const DEFAULT_MAX_SIZE: u32 = 10;
pub const DEFAULT_MIN_IDLE: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1_800;
pub const DEFAULT_LEAK_DETECTION_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 5;

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of physical connections (default: 10).
    pub max_size: u32,
    /// Idle connections the maintenance task keeps open (default: 1).
    pub min_idle: u32,
    /// How long `acquire` waits for a free connection, in milliseconds
    /// (default: 30000).
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are retired (default: 600).
    pub idle_timeout_secs: u64,
    /// Connections are retired once this old regardless of use
    /// (default: 1800).
    pub max_lifetime_secs: u64,
    /// A lease held longer than this triggers a leak warning (default: 60).
    pub leak_detection_threshold_secs: u64,
    /// Cadence of the background maintenance task (default: 5).
    pub maintenance_interval_secs: u64,
    /// Validate connections when they come back to the pool (default: true).
    pub test_on_release: bool,
    /// Isolation level connections are reset to on release
    /// (default: read committed).
    pub default_isolation: IsolationLevel,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            min_idle: DEFAULT_MIN_IDLE,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            leak_detection_threshold_secs: DEFAULT_LEAK_DETECTION_THRESHOLD_SECS,
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
            test_on_release: true,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl PoolConfig {
    /// Load a configuration from a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| format!("invalid pool configuration: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and return an error message if inconsistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".to_string());
        }
        if self.min_idle > self.max_size {
            return Err(format!(
                "min_idle ({}) cannot exceed max_size ({})",
                self.min_idle, self.max_size
            ));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_secs(self.leak_detection_threshold_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
