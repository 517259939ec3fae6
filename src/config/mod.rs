//! Configuration system for inferpool
//!
//! `ManagerConfig` holds the process-wide resource limits; `ModelConfig`
//! and `GenerationParams` are supplied per model and per request.

mod generation;
mod model;

pub use generation::GenerationParams;
pub use model::ModelConfig;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Resource manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Global memory budget in MB across all loaded models (0 = unlimited)
    #[serde(default)]
    pub memory_limit_mb: u64,

    /// Maximum number of contexts per model
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Idle pooled contexts older than this are destroyed by the reaper
    #[serde(default = "default_context_ttl")]
    pub context_ttl_secs: u64,

    /// How long `acquire` waits for a free context before giving up
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Maximum number of queued batch requests
    #[serde(default = "default_batch_queue_capacity")]
    pub batch_queue_capacity: usize,

    /// Completed batch results older than this are dropped by the reaper
    #[serde(default = "default_batch_result_ttl")]
    pub batch_result_ttl_secs: u64,

    /// Upper bound on retained batch results (oldest dropped first)
    #[serde(default = "default_max_batch_results")]
    pub max_batch_results: usize,

    /// Per-session token queue bound
    #[serde(default = "default_stream_queue_capacity")]
    pub stream_queue_capacity: usize,

    /// Finished sessions idle longer than this are removed by the reaper
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Interval between reaper sweeps
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_max_pool_size() -> usize {
    10
}

fn default_context_ttl() -> u64 {
    30 * 60
}

fn default_acquire_timeout() -> u64 {
    30_000
}

fn default_batch_queue_capacity() -> usize {
    1024
}

fn default_batch_result_ttl() -> u64 {
    60 * 60
}

fn default_max_batch_results() -> usize {
    10_000
}

fn default_stream_queue_capacity() -> usize {
    64
}

fn default_session_idle_timeout() -> u64 {
    5 * 60
}

fn default_reaper_interval() -> u64 {
    5 * 60
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 0,
            max_pool_size: default_max_pool_size(),
            context_ttl_secs: default_context_ttl(),
            acquire_timeout_ms: default_acquire_timeout(),
            batch_queue_capacity: default_batch_queue_capacity(),
            batch_result_ttl_secs: default_batch_result_ttl(),
            max_batch_results: default_max_batch_results(),
            stream_queue_capacity: default_stream_queue_capacity(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the global memory budget
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Set the per-model context limit
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Memory budget in bytes (0 = unlimited)
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn batch_result_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_result_ttl_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Reject limits that would leave the manager unable to serve anything
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::Config("max_pool_size must be at least 1".into()));
        }
        if self.batch_queue_capacity == 0 {
            return Err(Error::Config(
                "batch_queue_capacity must be at least 1".into(),
            ));
        }
        if self.stream_queue_capacity == 0 {
            return Err(Error::Config(
                "stream_queue_capacity must be at least 1".into(),
            ));
        }
        if self.reaper_interval_secs == 0 {
            return Err(Error::Config(
                "reaper_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
