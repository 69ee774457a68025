//! Threshold Controller Tests
//!
//! Tests verify:
//! - Initial threshold per memory policy
//! - Convergence toward the target ratio
//! - Configured bounds are never crossed
//! - Noise floor and zero-DRAM guards
//! - Check period gating
//! - Parsing of policy and ratio settings

use std::cell::Cell;

use tierkv::config::Config;
use tierkv::tiering::{
    Adjustment, MemoryPolicy, RatioWeights, Tier, ThresholdController, UsageSample,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn ratio_controller(dram: u32, pmem: u32) -> ThresholdController {
    let config = Config::builder()
        .memory_alloc_policy(MemoryPolicy::Ratio)
        .dram_pmem_ratio(dram, pmem)
        .initial_dynamic_threshold(64)
        .dynamic_threshold_bounds(24, 100)
        .build();
    ThresholdController::new(&config)
}

fn controller_with_policy(policy: MemoryPolicy) -> ThresholdController {
    let config = Config::builder()
        .memory_alloc_policy(policy)
        .static_threshold(128)
        .build();
    ThresholdController::new(&config)
}

// =============================================================================
// Policy Tests
// =============================================================================

#[test]
fn test_initial_threshold_per_policy() {
    assert_eq!(controller_with_policy(MemoryPolicy::OnlyDram).threshold(), usize::MAX);
    assert_eq!(controller_with_policy(MemoryPolicy::OnlyPmem).threshold(), 0);
    assert_eq!(controller_with_policy(MemoryPolicy::Threshold).threshold(), 128);
    assert_eq!(ratio_controller(1, 1).threshold(), 64);
}

#[test]
fn test_static_policies_never_adjust() {
    for policy in [MemoryPolicy::OnlyDram, MemoryPolicy::OnlyPmem, MemoryPolicy::Threshold] {
        let mut controller = controller_with_policy(policy);
        let before = controller.threshold();

        assert_eq!(controller.evaluate(UsageSample::new(10, 100_000)), Adjustment::Disabled);
        assert_eq!(controller.tick(|| UsageSample::new(10, 100_000)), Adjustment::Disabled);
        assert_eq!(controller.threshold(), before);
    }
}

#[test]
fn test_routing_rule() {
    let only_dram = controller_with_policy(MemoryPolicy::OnlyDram).handle();
    assert_eq!(only_dram.tier_for(1 << 30), Tier::Dram);

    let only_pmem = controller_with_policy(MemoryPolicy::OnlyPmem).handle();
    assert_eq!(only_pmem.tier_for(0), Tier::Pmem);

    let threshold = controller_with_policy(MemoryPolicy::Threshold).handle();
    assert!(!threshold.should_use_pmem(127));
    assert!(threshold.should_use_pmem(128));
    assert!(threshold.should_use_pmem(129));
}

#[test]
fn test_set_policy_reinitialises_threshold() {
    let mut controller = ratio_controller(1, 1);
    let handle = controller.handle();

    controller.set_policy(MemoryPolicy::OnlyPmem);
    assert_eq!(handle.get(), 0);
    assert_eq!(controller.policy(), MemoryPolicy::OnlyPmem);

    controller.set_policy(MemoryPolicy::Ratio);
    assert_eq!(handle.get(), 64);
}

// =============================================================================
// Convergence Tests
// =============================================================================

#[test]
fn test_convergence_toward_parity() {
    let mut controller = ratio_controller(1, 1);

    // PMEM held at 2000 while DRAM climbs toward parity
    let outcomes: Vec<Adjustment> = [500, 1000, 1500, 2000]
        .into_iter()
        .map(|dram| controller.evaluate(UsageSample::new(dram, 2000)))
        .collect();

    assert_eq!(outcomes[0], Adjustment::Raised { from: 64, to: 68 });
    assert_eq!(outcomes[1], Adjustment::Raised { from: 68, to: 72 });
    assert_eq!(outcomes[2], Adjustment::Raised { from: 72, to: 76 });
    assert!(matches!(outcomes[3], Adjustment::WithinMargin { .. }));
    assert_eq!(controller.threshold(), 76);
}

#[test]
fn test_small_usage_changes_hit_noise_floor() {
    let mut controller = ratio_controller(1, 1);

    // Steps of 50 units: only the first cycle moves far enough from zero
    let outcomes: Vec<Adjustment> = [50, 100, 150, 200]
        .into_iter()
        .map(|dram| controller.evaluate(UsageSample::new(dram, 200)))
        .collect();

    assert_eq!(outcomes[0], Adjustment::Raised { from: 64, to: 68 });
    for outcome in &outcomes[1..] {
        assert_eq!(*outcome, Adjustment::BelowNoiseFloor);
    }
    assert_eq!(controller.threshold(), 68);
}

#[test]
fn test_too_little_pmem_lowers_threshold() {
    let mut controller = ratio_controller(1, 3);

    let outcome = controller.evaluate(UsageSample::new(1000, 1000));
    assert_eq!(outcome, Adjustment::Lowered { from: 64, to: 60 });
}

#[test]
fn test_within_margin_is_left_alone() {
    let mut controller = ratio_controller(1, 2);

    // 2.05 vs 2.0
    let outcome = controller.evaluate(UsageSample::new(1000, 2050));
    match outcome {
        Adjustment::WithinMargin { current, target } => {
            assert!((current - 2.05).abs() < 1e-9);
            assert!((target - 2.0).abs() < 1e-9);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(controller.threshold(), 64);
}

// =============================================================================
// Bounds Tests
// =============================================================================

#[test]
fn test_threshold_never_exceeds_max() {
    let mut controller = ratio_controller(1, 1);
    let mut last = None;

    for cycle in 1..=20usize {
        last = Some(controller.evaluate(UsageSample::new(1, cycle * 1000)));
        assert!(controller.threshold() <= 100);
    }

    assert_eq!(controller.threshold(), 99);
    assert_eq!(last, Some(Adjustment::BoundReached { attempted: 104 }));
}

#[test]
fn test_threshold_never_drops_below_min() {
    let mut controller = ratio_controller(1, 3);
    let mut last = None;

    for cycle in 1..=30usize {
        last = Some(controller.evaluate(UsageSample::new(cycle * 1000, 0)));
        assert!(controller.threshold() >= 24);
    }

    assert_eq!(controller.threshold(), 25);
    assert_eq!(last, Some(Adjustment::BoundReached { attempted: 23 }));
}

#[test]
fn test_checkpoints_refresh_at_bound() {
    let mut controller = ratio_controller(1, 1);
    for cycle in 1..=20usize {
        controller.evaluate(UsageSample::new(1, cycle * 1000));
    }

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.dram_checkpoint, 1);
    assert_eq!(snapshot.pmem_checkpoint, 20_000);
}

// =============================================================================
// Guard Tests
// =============================================================================

#[test]
fn test_noise_floor_still_updates_checkpoints() {
    let mut controller = ratio_controller(1, 1);
    controller.evaluate(UsageSample::new(1000, 1000));

    let outcome = controller.evaluate(UsageSample::new(1030, 1060));
    assert_eq!(outcome, Adjustment::BelowNoiseFloor);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.dram_checkpoint, 1030);
    assert_eq!(snapshot.pmem_checkpoint, 1060);
}

#[test]
fn test_change_of_exactly_noise_floor_is_ignored() {
    let mut controller = ratio_controller(1, 1);
    controller.evaluate(UsageSample::new(1000, 1000));

    assert_eq!(controller.evaluate(UsageSample::new(1000, 1100)), Adjustment::BelowNoiseFloor);
    assert_ne!(controller.evaluate(UsageSample::new(1000, 1201)), Adjustment::BelowNoiseFloor);
}

#[test]
fn test_zero_dram_usage_is_degenerate() {
    let mut controller = ratio_controller(1, 1);

    let outcome = controller.evaluate(UsageSample::new(0, 5000));
    assert_eq!(outcome, Adjustment::Degenerate);
    assert_eq!(controller.threshold(), 64);
    assert_eq!(controller.snapshot().pmem_checkpoint, 5000);
}

// =============================================================================
// Check Period Tests
// =============================================================================

#[test]
fn test_check_period_gates_sampling() {
    let config = Config::builder()
        .memory_alloc_policy(MemoryPolicy::Ratio)
        .ratio_check_period(3)
        .build();
    let mut controller = ThresholdController::new(&config);
    let samples = Cell::new(0);

    let mut outcomes = Vec::new();
    for tick in 0..7usize {
        outcomes.push(controller.tick(|| {
            samples.set(samples.get() + 1);
            UsageSample::new(1000, (tick + 1) * 10_000)
        }));
    }

    // Ticks 0, 3 and 6 are due
    assert_eq!(samples.get(), 3);
    for (tick, outcome) in outcomes.iter().enumerate() {
        if tick % 3 == 0 {
            assert_ne!(*outcome, Adjustment::NotDue, "tick {}", tick);
        } else {
            assert_eq!(*outcome, Adjustment::NotDue, "tick {}", tick);
        }
    }
}

#[test]
fn test_handle_sees_controller_updates() {
    let mut controller = ratio_controller(1, 1);
    let handle = controller.handle();

    controller.evaluate(UsageSample::new(500, 2000));
    assert_eq!(handle.get(), 68);
    assert!(handle.should_use_pmem(68));
    assert!(!handle.should_use_pmem(67));
}

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_parse_policy() {
    assert_eq!("ratio".parse::<MemoryPolicy>().unwrap(), MemoryPolicy::Ratio);
    assert_eq!("ONLY-PMEM".parse::<MemoryPolicy>().unwrap(), MemoryPolicy::OnlyPmem);
    assert!("sometimes".parse::<MemoryPolicy>().is_err());
    assert_eq!(MemoryPolicy::OnlyDram.to_string(), "only-dram");
}

#[test]
fn test_parse_ratio() {
    assert_eq!("1:3".parse::<RatioWeights>().unwrap(), RatioWeights { dram: 1, pmem: 3 });
    assert_eq!("2 5".parse::<RatioWeights>().unwrap(), RatioWeights { dram: 2, pmem: 5 });
    assert!("1:2:3".parse::<RatioWeights>().is_err());
    assert!("one:two".parse::<RatioWeights>().is_err());
    assert_eq!(RatioWeights { dram: 1, pmem: 4 }.to_string(), "1:4");
}

#[test]
fn test_config_validation() {
    let bad_bounds = Config::builder().dynamic_threshold_bounds(100, 10).build();
    assert!(bad_bounds.validate().is_err());

    let zero_dram_weight = Config::builder().dram_pmem_ratio(0, 1).build();
    assert!(zero_dram_weight.validate().is_err());

    assert!(Config::default().validate().is_ok());
}
