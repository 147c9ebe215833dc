//! Deterministic leaky-bucket experiments
//!
//! Simulates a workload in which a share of every cycle is spent inside
//! governed operations ("measured" work) and the rest outside of them. Time
//! is driven by a [`ManualClock`], so an experiment of millions of invocations
//! takes milliseconds and always produces the same result for the same seed.
//!
//! Each cycle:
//!
//! 1. the governed operation advances the clock by the invocation time,
//!    jittered by ±6% of seeded noise (skipped if the governor throttles)
//! 2. untracked work advances the clock by `invocation * (100 / measured - 1)`
//!
//! Simulated time behaves much better with noise: without it a coarse clock
//! can alias with the cycle length and hide all the measured work.

use crate::clock::ManualClock;
use crate::governor::OverheadGovernor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Width of the relative noise band applied to each invocation
pub const RANDOMNESS: f64 = 0.12;

#[derive(Error, Debug, PartialEq)]
pub enum SimulationError {
    #[error("measured load must be in (0, 100], got {0}")]
    InvalidLoad(f64),

    #[error("simulation worker panicked")]
    WorkerPanicked,
}

/// Parameters of one experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Governor target in percent
    pub target_percent: f64,
    /// Skip operations while over budget
    pub throttle: bool,
    /// Granularity of the simulated clock; 0 is exact
    pub precision_ns: u64,
    /// Mean duration of one governed operation
    pub invocation_ns: u64,
    /// Number of cycles
    pub repeats: u64,
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            target_percent: 1.0,
            throttle: true,
            precision_ns: 10_000,
            invocation_ns: 16_000,
            repeats: 5_000,
            seed: 42,
        }
    }
}

/// Outcome of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExperimentReport {
    /// Governed operations that ran
    pub measured: u64,
    /// Governed operations skipped by throttling
    pub skipped: u64,
    /// Untracked work expressed in invocation units
    pub non_measured: u64,
    /// Share of measured work after throttling
    pub ratio: f64,
}

impl ExperimentReport {
    /// Achieved share of measured work in percent
    pub fn percent(&self) -> f64 {
        self.ratio * 100.0
    }
}

fn validate(measured_percent: f64) -> Result<f64, SimulationError> {
    if measured_percent > 0.0 && measured_percent <= 100.0 {
        Ok(measured_percent)
    } else {
        Err(SimulationError::InvalidLoad(measured_percent))
    }
}

fn governor_for(config: &ExperimentConfig, clock: &Arc<ManualClock>) -> OverheadGovernor {
    let governor = OverheadGovernor::with_clock(config.target_percent, clock.clone());
    governor.set_throttle(config.throttle);
    governor
}

/// Run one experiment where `measured_percent` of the work is governed
pub fn run_experiment(
    config: &ExperimentConfig,
    measured_percent: f64,
) -> Result<ExperimentReport, SimulationError> {
    let measured_percent = validate(measured_percent)?;
    let clock = Arc::new(ManualClock::new(config.precision_ns));
    let governor = governor_for(config, &clock);
    Ok(simulate(&governor, &clock, config, config.seed, measured_percent))
}

/// Run one experiment per load, each on its own thread, sharing one governor
///
/// Results are returned in the order of `measured_percents`.
pub fn run_concurrent(
    config: &ExperimentConfig,
    measured_percents: &[f64],
) -> Result<Vec<ExperimentReport>, SimulationError> {
    for percent in measured_percents {
        validate(*percent)?;
    }
    let clock = Arc::new(ManualClock::new(config.precision_ns));
    let governor = governor_for(config, &clock);

    std::thread::scope(|scope| {
        let handles: Vec<_> = measured_percents
            .iter()
            .enumerate()
            .map(|(i, percent)| {
                let governor = &governor;
                let clock = &clock;
                let seed = config.seed.wrapping_add(i as u64);
                scope.spawn(move || simulate(governor, clock, config, seed, *percent))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| SimulationError::WorkerPanicked))
            .collect()
    })
}

fn simulate(
    governor: &OverheadGovernor,
    clock: &ManualClock,
    config: &ExperimentConfig,
    seed: u64,
    measured_percent: f64,
) -> ExperimentReport {
    let tracker = governor.tracker();
    let multiplier = 100.0 / measured_percent - 1.0;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut measured = 0u64;

    for _ in 0..config.repeats {
        let noise = rng.gen::<f64>() * RANDOMNESS - RANDOMNESS / 2.0;
        let invocation = config.invocation_ns as f64 * (1.0 + noise);
        let ran = tracker
            .run_if_no_overhead(|| clock.advance(invocation.round() as u64))
            .is_some();
        if ran {
            measured += 1;
        }
        clock.advance((invocation * multiplier).round() as u64);
    }

    // Saturates for vanishing loads
    let non_measured = (config.repeats as f64 * multiplier) as u64;
    let total = measured.saturating_add(non_measured);
    ExperimentReport {
        measured,
        skipped: config.repeats - measured,
        non_measured,
        ratio: if total == 0 { 0.0 } else { measured as f64 / total as f64 },
    }
}
