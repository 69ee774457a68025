//! Adaptive Threshold Controller
//!
//! Periodically compares observed PMEM/DRAM usage against the configured
//! target and nudges the routing threshold by a relative step.
//!
//! ## Cycle
//! ```text
//!  sample ──► |total - checkpoint| <= NOISE_FLOOR ? ──yes──► skip
//!                 │ no
//!                 ▼
//!           dram == 0 ? ──yes──► skip
//!                 │ no
//!                 ▼
//!      |target - pmem/dram| <= RATIO_MARGIN ? ──yes──► skip
//!                 │ no
//!                 ▼
//!   target < current ? raise (≤ max) : lower (≥ min)
//!
//!  checkpoints := sample   (every evaluated cycle)
//! ```
//!
//! The controller is the only writer of the threshold. Allocation call
//! sites read it through a [`ThresholdHandle`] without locking; a slightly
//! stale value is acceptable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Config;

use super::{
    MemoryPolicy, RatioWeights, Tier, UsageSample, NOISE_FLOOR, RATIO_MARGIN,
    THRESHOLD_STEP_PERCENT,
};

/// Shared, read-mostly view of the current threshold
#[derive(Debug, Clone)]
pub struct ThresholdHandle {
    threshold: Arc<AtomicUsize>,
}

impl ThresholdHandle {
    fn new(initial: usize) -> Self {
        Self {
            threshold: Arc::new(AtomicUsize::new(initial)),
        }
    }

    /// Current threshold in bytes
    pub fn get(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    fn set(&self, value: usize) {
        self.threshold.store(value, Ordering::Relaxed);
    }

    /// Allocation routing rule
    pub fn should_use_pmem(&self, size: usize) -> bool {
        size >= self.get()
    }

    pub fn tier_for(&self, size: usize) -> Tier {
        if self.should_use_pmem(size) {
            Tier::Pmem
        } else {
            Tier::Dram
        }
    }
}

/// What one controller cycle did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// The policy is static; the controller is bypassed
    Disabled,
    /// Not a check-period tick
    NotDue,
    /// Total usage moved by no more than the noise floor
    BelowNoiseFloor,
    /// DRAM usage is zero, so the ratio is undefined
    Degenerate,
    /// Observed ratio is within the margin of the target
    WithinMargin { current: f64, target: f64 },
    Raised { from: usize, to: usize },
    Lowered { from: usize, to: usize },
    /// The step would cross a configured bound; threshold left unchanged
    BoundReached { attempted: usize },
}

/// Read-only copy of the tiering state
#[derive(Debug, Clone, PartialEq)]
pub struct TieringSnapshot {
    pub policy: MemoryPolicy,
    pub threshold: usize,
    pub ratio: RatioWeights,
    pub dram_checkpoint: usize,
    pub pmem_checkpoint: usize,
    pub threshold_min: usize,
    pub threshold_max: usize,
    pub check_period: u64,
}

/// Single-writer owner of the tiering state
pub struct ThresholdController {
    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------
    policy: MemoryPolicy,
    ratio: RatioWeights,
    check_period: u64,
    static_threshold: usize,
    initial_dynamic_threshold: usize,
    threshold_min: usize,
    threshold_max: usize,

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------
    dram_checkpoint: usize,
    pmem_checkpoint: usize,

    /// Maintenance ticks seen so far
    cron_loops: u64,

    threshold: ThresholdHandle,
}

impl ThresholdController {
    /// Build the controller and set the initial threshold for the policy
    pub fn new(config: &Config) -> Self {
        let mut controller = Self {
            policy: config.memory_alloc_policy,
            ratio: config.dram_pmem_ratio,
            check_period: config.ratio_check_period.max(1),
            static_threshold: config.static_threshold,
            initial_dynamic_threshold: config.initial_dynamic_threshold,
            threshold_min: config.dynamic_threshold_min,
            threshold_max: config.dynamic_threshold_max,
            dram_checkpoint: 0,
            pmem_checkpoint: 0,
            cron_loops: 0,
            threshold: ThresholdHandle::new(0),
        };
        controller.init_threshold();
        controller
    }

    fn init_threshold(&mut self) {
        let threshold = match self.policy {
            MemoryPolicy::OnlyDram => usize::MAX,
            MemoryPolicy::OnlyPmem => 0,
            MemoryPolicy::Threshold => self.static_threshold,
            MemoryPolicy::Ratio => self.initial_dynamic_threshold,
        };
        self.threshold.set(threshold);
        tracing::info!("Memory policy {}: threshold set to {}", self.policy, threshold);
    }

    /// Switch policy and re-initialise the threshold
    pub fn set_policy(&mut self, policy: MemoryPolicy) {
        self.policy = policy;
        self.init_threshold();
    }

    /// Handle for allocation call sites
    pub fn handle(&self) -> ThresholdHandle {
        self.threshold.clone()
    }

    pub fn threshold(&self) -> usize {
        self.threshold.get()
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    pub fn snapshot(&self) -> TieringSnapshot {
        TieringSnapshot {
            policy: self.policy,
            threshold: self.threshold.get(),
            ratio: self.ratio,
            dram_checkpoint: self.dram_checkpoint,
            pmem_checkpoint: self.pmem_checkpoint,
            threshold_min: self.threshold_min,
            threshold_max: self.threshold_max,
            check_period: self.check_period,
        }
    }

    // =========================================================================
    // Control Loop
    // =========================================================================

    /// One maintenance tick
    ///
    /// `sample` is only invoked on check-period ticks under the ratio policy.
    pub fn tick<F>(&mut self, sample: F) -> Adjustment
    where
        F: FnOnce() -> UsageSample,
    {
        let due = self.cron_loops % self.check_period == 0;
        self.cron_loops = self.cron_loops.wrapping_add(1);

        if self.policy != MemoryPolicy::Ratio {
            return Adjustment::Disabled;
        }
        if !due {
            return Adjustment::NotDue;
        }
        self.evaluate(sample())
    }

    /// Run one adjustment cycle against `sample`
    pub fn evaluate(&mut self, sample: UsageSample) -> Adjustment {
        if self.policy != MemoryPolicy::Ratio {
            return Adjustment::Disabled;
        }

        let outcome = self.decide(sample);

        self.dram_checkpoint = sample.dram;
        self.pmem_checkpoint = sample.pmem;

        match outcome {
            Adjustment::Raised { from, to } | Adjustment::Lowered { from, to } => {
                tracing::info!(
                    "Threshold {} -> {} (dram={} pmem={} target {})",
                    from,
                    to,
                    sample.dram,
                    sample.pmem,
                    self.ratio
                );
            }
            other => tracing::trace!("Threshold unchanged: {:?}", other),
        }
        outcome
    }

    fn decide(&mut self, sample: UsageSample) -> Adjustment {
        let checkpoint = self.dram_checkpoint.saturating_add(self.pmem_checkpoint);
        if sample.total().abs_diff(checkpoint) <= NOISE_FLOOR {
            return Adjustment::BelowNoiseFloor;
        }
        if sample.dram == 0 {
            return Adjustment::Degenerate;
        }

        let target = self.ratio.target();
        let current = sample.pmem as f64 / sample.dram as f64;
        if (target - current).abs() <= RATIO_MARGIN {
            return Adjustment::WithinMargin { current, target };
        }

        let from = self.threshold.get();
        if target < current {
            // Too much lands in PMEM: route more to DRAM
            let to = step_up(from);
            if to > self.threshold_max {
                return Adjustment::BoundReached { attempted: to };
            }
            self.threshold.set(to);
            Adjustment::Raised { from, to }
        } else {
            let to = step_down(from);
            if to < self.threshold_min {
                return Adjustment::BoundReached { attempted: to };
            }
            self.threshold.set(to);
            Adjustment::Lowered { from, to }
        }
    }
}

/// Threshold plus 5%, rounded up
pub(crate) fn step_up(threshold: usize) -> usize {
    let scaled = threshold as u128 * u128::from(100 + THRESHOLD_STEP_PERCENT);
    usize::try_from(scaled.div_ceil(100)).unwrap_or(usize::MAX)
}

/// Threshold minus 5%, rounded down
pub(crate) fn step_down(threshold: usize) -> usize {
    let scaled = threshold as u128 * u128::from(100 - THRESHOLD_STEP_PERCENT);
    usize::try_from(scaled / 100).unwrap_or(usize::MAX)
}
