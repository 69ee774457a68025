//! Configuration for tierkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, TierError};
use crate::tiering::{MemoryPolicy, RatioWeights};

/// Main configuration for a tierkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Pool Configuration
    // -------------------------------------------------------------------------
    /// Pool image file. `None` keeps the pool purely in-process.
    pub pool_path: Option<PathBuf>,

    /// Capacity of the persistent pool (in bytes)
    pub pool_size: usize,

    // -------------------------------------------------------------------------
    // Tiering Configuration
    // -------------------------------------------------------------------------
    /// How allocations are routed between DRAM and PMEM
    pub memory_alloc_policy: MemoryPolicy,

    /// Target DRAM:PMEM weight pair (ratio policy only)
    pub dram_pmem_ratio: RatioWeights,

    /// Re-evaluate the threshold every N maintenance ticks
    pub ratio_check_period: u64,

    /// Threshold used by the static threshold policy (in bytes)
    pub static_threshold: usize,

    /// Starting threshold for the ratio policy (in bytes)
    pub initial_dynamic_threshold: usize,

    /// Lower bound for the ratio policy's threshold (in bytes)
    pub dynamic_threshold_min: usize,

    /// Upper bound for the ratio policy's threshold (in bytes)
    pub dynamic_threshold_max: usize,

    // -------------------------------------------------------------------------
    // Maintenance Configuration
    // -------------------------------------------------------------------------
    /// Maintenance ticks per second
    pub hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_path: None,
            pool_size: 64 * 1024 * 1024, // 64 MB
            memory_alloc_policy: MemoryPolicy::OnlyDram,
            dram_pmem_ratio: RatioWeights { dram: 1, pmem: 3 },
            ratio_check_period: 1,
            static_threshold: 64,
            initial_dynamic_threshold: 64,
            dynamic_threshold_min: 24,
            dynamic_threshold_max: 10_000,
            hz: 10,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(TierError::Config("pool_size must be non-zero".to_string()));
        }
        if self.dram_pmem_ratio.dram == 0 {
            return Err(TierError::Config(
                "dram weight of dram_pmem_ratio must be non-zero".to_string(),
            ));
        }
        if self.ratio_check_period == 0 {
            return Err(TierError::Config(
                "ratio_check_period must be at least one tick".to_string(),
            ));
        }
        if self.dynamic_threshold_min > self.dynamic_threshold_max {
            return Err(TierError::Config(format!(
                "dynamic_threshold_min ({}) exceeds dynamic_threshold_max ({})",
                self.dynamic_threshold_min, self.dynamic_threshold_max
            )));
        }
        if self.hz == 0 {
            return Err(TierError::Config("hz must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Interval between two maintenance ticks
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1000 / u64::from(self.hz.max(1)))
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Back the pool with an image file
    pub fn pool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pool_path = Some(path.into());
        self
    }

    /// Set the pool capacity (in bytes)
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the memory allocation policy
    pub fn memory_alloc_policy(mut self, policy: MemoryPolicy) -> Self {
        self.config.memory_alloc_policy = policy;
        self
    }

    /// Set the DRAM:PMEM target weights
    pub fn dram_pmem_ratio(mut self, dram: u32, pmem: u32) -> Self {
        self.config.dram_pmem_ratio = RatioWeights { dram, pmem };
        self
    }

    /// Set the ratio check period (in maintenance ticks)
    pub fn ratio_check_period(mut self, ticks: u64) -> Self {
        self.config.ratio_check_period = ticks;
        self
    }

    /// Set the static threshold (in bytes)
    pub fn static_threshold(mut self, bytes: usize) -> Self {
        self.config.static_threshold = bytes;
        self
    }

    /// Set the initial dynamic threshold (in bytes)
    pub fn initial_dynamic_threshold(mut self, bytes: usize) -> Self {
        self.config.initial_dynamic_threshold = bytes;
        self
    }

    /// Set the dynamic threshold bounds (in bytes)
    pub fn dynamic_threshold_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.dynamic_threshold_min = min;
        self.config.dynamic_threshold_max = max;
        self
    }

    /// Set the maintenance frequency
    pub fn hz(mut self, hz: u32) -> Self {
        self.config.hz = hz;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
