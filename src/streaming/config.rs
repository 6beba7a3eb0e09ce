//! Cache configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::TileError;
use crate::core::types::Result;

/// Tunables for a [`CacheManager`](super::CacheManager).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of tile decodes running at once
    pub worker_threads: usize,
    /// Completions applied per `process_requests` call
    pub max_completions_per_pump: usize,
    /// Load everything on the calling thread
    pub synchronous: bool,
    /// Run the staleness sweep every N pumps (0 disables it)
    pub flush_interval_pumps: u64,
    /// Draw passes after which an unused payload is evicted
    pub stale_after_ticks: u64,
    /// Draw passes after which an unused GPU resource is released
    pub graphic_stale_after_ticks: Option<u64>,
    pub cpu_budget_mb: Option<usize>,
    pub gpu_budget_mb: Option<usize>,
    /// Retries for transient I/O failures before giving up on a tile
    pub max_retries: u32,
    /// Base retry delay in pumps, doubled per attempt
    pub retry_backoff_pumps: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_completions_per_pump: 32,
            synchronous: false,
            flush_interval_pumps: 60,
            stale_after_ticks: 600,
            graphic_stale_after_ticks: None,
            cpu_budget_mb: None,
            gpu_budget_mb: None,
            max_retries: 3,
            retry_backoff_pumps: 8,
        }
    }
}

impl CacheConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&json)
            .map_err(|e| TileError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(TileError::Config("worker_threads must be at least 1".into()));
        }
        if self.max_completions_per_pump == 0 {
            return Err(TileError::Config("max_completions_per_pump must be at least 1".into()));
        }
        Ok(())
    }

    /// Pumps to wait before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff_pumps.saturating_mul(1 << shift)
    }
}
