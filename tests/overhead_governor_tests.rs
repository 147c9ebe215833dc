//! Integration tests for the overhead governor
//!
//! Long simulated runs on a manual clock check the leaky bucket against its
//! contract: work below the target is never throttled, work above it is, and
//! the achieved share converges to the target.
//!
//! # Test Coverage
//!
//! - Load grid across clock precisions
//! - Independent workers sharing one governor
//! - Detection without throttling
//! - Detection listener enabling throttling at runtime

use hilvan::clock::ManualClock;
use hilvan::governor::OverheadGovernor;
use hilvan::throttle_sim::{run_concurrent, run_experiment, ExperimentConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TARGET: f64 = 1.0;
const PRECISIONS: [u64; 3] = [0, 1_000, 10_000];
const LOADS: [f64; 6] = [0.5, 0.8, 1.0, 2.0, 5.0, 10.0];

/// Tolerated overshoot of the achieved share over the target
const THROTTLING_FACTOR: f64 = 1.4;

fn config(precision_ns: u64) -> ExperimentConfig {
    ExperimentConfig {
        target_percent: TARGET,
        precision_ns,
        repeats: 100_000,
        ..ExperimentConfig::default()
    }
}

#[test]
fn test_throttling_grid() {
    for precision_ns in PRECISIONS {
        for load in LOADS {
            let report = run_experiment(&config(precision_ns), load).unwrap();
            let context = format!("precision {}ns load {}%: {:?}", precision_ns, load, report);

            if load >= 1.15 * TARGET {
                assert!(report.skipped > 0, "expected skips, {}", context);
            }
            if load >= 0.85 * TARGET {
                assert!(report.percent() <= THROTTLING_FACTOR * TARGET, "overshoot, {}", context);
            } else {
                assert_eq!(report.skipped, 0, "unexpected skips, {}", context);
            }
        }
    }
}

#[test]
fn test_short_runs_keep_outcomes() {
    // 5000 trials are enough to separate the two sides of the target
    for precision_ns in PRECISIONS {
        let config = ExperimentConfig {
            precision_ns,
            ..ExperimentConfig::default()
        };
        assert_eq!(run_experiment(&config, 0.8 * TARGET).unwrap().skipped, 0);
        assert!(run_experiment(&config, 2.0 * TARGET).unwrap().skipped > 0);
    }
}

#[test]
fn test_workers_judged_independently() {
    for precision_ns in PRECISIONS {
        let config = ExperimentConfig {
            precision_ns,
            ..ExperimentConfig::default()
        };
        let reports = run_concurrent(&config, &[0.8, 2.0, 0.5, 4.0]).unwrap();
        assert_eq!(reports[0].skipped, 0, "precision {}", precision_ns);
        assert!(reports[1].skipped > 0, "precision {}", precision_ns);
        assert_eq!(reports[2].skipped, 0, "precision {}", precision_ns);
        assert!(reports[3].skipped > 0, "precision {}", precision_ns);
    }
}

#[test]
fn test_no_throttle_runs_everything() {
    for load in LOADS {
        let config = ExperimentConfig {
            throttle: false,
            ..config(0)
        };
        let report = run_experiment(&config, load).unwrap();
        assert_eq!(report.skipped, 0, "load {}", load);
        assert_eq!(report.measured, config.repeats);
    }
}

/// Drive `governor` at `load` percent with exact time steps
fn drive(governor: &OverheadGovernor, clock: &ManualClock, load: f64, repeats: u64) -> (u64, u64) {
    let tracker = governor.tracker();
    let invocation = 16_000u64;
    let outside = (invocation as f64 * (100.0 / load - 1.0)) as u64;
    for _ in 0..repeats {
        tracker.run_if_no_overhead(|| clock.advance(invocation));
        clock.advance(outside);
    }
    (tracker.executed(), tracker.skipped())
}

#[test]
fn test_detection_without_throttling() {
    let clock = Arc::new(ManualClock::new(0));
    let governor = OverheadGovernor::with_clock(TARGET, clock.clone());

    let (executed, skipped) = drive(&governor, &clock, 0.5, 5_000);
    assert_eq!((executed, skipped), (5_000, 0));
    assert!(!governor.overhead_detected());

    let (executed, skipped) = drive(&governor, &clock, 5.0, 5_000);
    assert_eq!((executed, skipped), (5_000, 0));
    assert!(governor.overhead_detected());
}

#[test]
fn test_listener_enables_throttling() {
    let clock = Arc::new(ManualClock::new(0));
    let governor = OverheadGovernor::with_clock(TARGET, clock.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    assert!(governor.on_overhead_detected(move |governor| {
        seen.fetch_add(1, Ordering::SeqCst);
        governor.set_throttle(true);
    }));

    let (_, skipped) = drive(&governor, &clock, 5.0, 5_000);
    assert!(skipped > 0);
    assert!(governor.is_throttling());

    // Detection on a second worker does not notify again
    std::thread::scope(|scope| {
        scope.spawn(|| drive(&governor, &clock, 5.0, 5_000));
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
