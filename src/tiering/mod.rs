//! Tiering Module
//!
//! Decides whether new data lives in DRAM or in persistent memory.
//!
//! ## Routing Rule
//! Every allocation of `size` bytes goes to PMEM when
//! `size >= threshold`, and to DRAM otherwise. The threshold is fixed for the
//! static policies and steered by [`ThresholdController`] for
//! [`MemoryPolicy::Ratio`].

use std::fmt;
use std::str::FromStr;

use crate::error::TierError;

mod controller;

pub use controller::{Adjustment, ThresholdController, ThresholdHandle, TieringSnapshot};

/// Changes in total usage at or below this many bytes are ignored
pub const NOISE_FLOOR: usize = 100;

/// Ratio deviation tolerated before the threshold moves
pub const RATIO_MARGIN: f64 = 0.1;

/// Relative threshold step, in percent
pub const THRESHOLD_STEP_PERCENT: u64 = 5;

/// Where an allocation lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Dram,
    Pmem,
}

/// Memory allocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Everything in DRAM
    OnlyDram,
    /// Everything in PMEM
    OnlyPmem,
    /// Fixed threshold, never adjusted
    Threshold,
    /// Threshold steered toward a DRAM:PMEM usage ratio
    Ratio,
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryPolicy::OnlyDram => "only-dram",
            MemoryPolicy::OnlyPmem => "only-pmem",
            MemoryPolicy::Threshold => "threshold",
            MemoryPolicy::Ratio => "ratio",
        };
        f.write_str(name)
    }
}

impl FromStr for MemoryPolicy {
    type Err = TierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "only-dram" => Ok(MemoryPolicy::OnlyDram),
            "only-pmem" => Ok(MemoryPolicy::OnlyPmem),
            "threshold" => Ok(MemoryPolicy::Threshold),
            "ratio" => Ok(MemoryPolicy::Ratio),
            other => Err(TierError::Config(format!(
                "unknown memory policy '{}' (expected only-dram, only-pmem, threshold or ratio)",
                other
            ))),
        }
    }
}

/// Target DRAM:PMEM weight pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatioWeights {
    pub dram: u32,
    pub pmem: u32,
}

impl RatioWeights {
    /// Target PMEM/DRAM ratio
    pub fn target(&self) -> f64 {
        f64::from(self.pmem) / f64::from(self.dram)
    }
}

impl fmt::Display for RatioWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dram, self.pmem)
    }
}

impl FromStr for RatioWeights {
    type Err = TierError;

    /// Parses `"dram:pmem"` or `"dram pmem"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c == ':' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();

        let [dram, pmem] = parts.as_slice() else {
            return Err(TierError::Config(format!(
                "ratio '{}' must have the form dram:pmem",
                s
            )));
        };

        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|e| TierError::Config(format!("bad ratio weight '{}': {}", part, e)))
        };

        Ok(RatioWeights {
            dram: parse(*dram)?,
            pmem: parse(*pmem)?,
        })
    }
}

/// One observation of memory usage in both tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub dram: usize,
    pub pmem: usize,
}

impl UsageSample {
    pub fn new(dram: usize, pmem: usize) -> Self {
        Self { dram, pmem }
    }

    pub fn total(&self) -> usize {
        self.dram.saturating_add(self.pmem)
    }
}
