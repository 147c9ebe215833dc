//! Self-throttling overhead governor (leaky bucket)
//!
//! Every tracked engine operation runs through a per-worker [`OverheadTracker`]
//! that measures how much time the instrumentation itself consumes. The budget
//! is a leaky bucket over a sliding period:
//!
//! - `PERIOD_NS = 2^29 ns` (about 537 ms)
//! - `max_budget = round(target_percent * PERIOD_NS / 100)`
//! - idle time restores budget proportionally: `elapsed * max_budget / PERIOD_NS`
//! - the bucket is capped at `2 * max_budget` so a single spike drains within
//!   two full periods
//!
//! When the bucket is full the first worker to notice reports it once for the
//! whole process. If throttling is enabled, further operations are skipped until
//! enough budget has leaked away.
//!
//! # Design
//!
//! ```text
//! OverheadGovernor (shared, atomics)      OverheadTracker (per worker, Cells)
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ max_budget_ns                │◄───────│ last_time, accumulated       │
//! │ throttle: AtomicBool         │        │ in_progress                  │
//! │ first_detected: AtomicBool   │        │ local_throttle (sticky)      │
//! │ clock: Arc<dyn Clock>        │        │ local_first_detected         │
//! │ listener                     │        │ executed / skipped counters  │
//! └──────────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! The per-worker state is never shared between threads, so it needs no
//! synchronization. Global flags are read with relaxed ordering; a stale read
//! only delays throttling by one invocation.

use crate::clock::{default_clock, Clock};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Length of the leaky bucket period in nanoseconds
pub const PERIOD_NS: u64 = 1 << 29;

type Listener = Box<dyn Fn(&OverheadGovernor) + Send + Sync>;

struct GovernorInner {
    target_percent: f64,
    max_budget_ns: u64,
    throttle: AtomicBool,
    first_detected: AtomicBool,
    clock: Arc<dyn Clock>,
    listener: OnceLock<Listener>,
}

/// Process-wide overhead governor
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OverheadGovernor {
    inner: Arc<GovernorInner>,
}

impl OverheadGovernor {
    /// Create a governor on the shared coarse clock
    pub fn new(target_percent: f64) -> Self {
        Self::with_clock(target_percent, default_clock())
    }

    /// Create a governor reading time from `clock`
    ///
    /// `target_percent` is clamped to `0..=100`; NaN is treated as 100
    /// (no governing).
    pub fn with_clock(target_percent: f64, clock: Arc<dyn Clock>) -> Self {
        let target_percent = if target_percent.is_nan() {
            100.0
        } else {
            target_percent.clamp(0.0, 100.0)
        };
        let max_budget_ns = (target_percent * PERIOD_NS as f64 / 100.0).round() as u64;
        OverheadGovernor {
            inner: Arc::new(GovernorInner {
                target_percent,
                max_budget_ns,
                throttle: AtomicBool::new(false),
                first_detected: AtomicBool::new(false),
                clock,
                listener: OnceLock::new(),
            }),
        }
    }

    /// Create a tracker for the calling worker
    ///
    /// A target of 100% or more yields a tracker that always runs and does no
    /// bookkeeping.
    pub fn tracker(&self) -> OverheadTracker {
        if self.inner.target_percent >= 100.0 {
            return OverheadTracker::Disabled;
        }
        OverheadTracker::Active(ActiveTracker {
            governor: self.clone(),
            last_time: Cell::new(self.inner.clock.now_ns()),
            accumulated: Cell::new(0),
            in_progress: Cell::new(false),
            local_throttle: Cell::new(self.is_throttling()),
            local_first_detected: Cell::new(self.overhead_detected()),
            executed: Cell::new(0),
            skipped: Cell::new(0),
        })
    }

    /// Enable or disable skipping operations while over budget
    pub fn set_throttle(&self, throttle: bool) {
        self.inner.throttle.store(throttle, Ordering::Relaxed);
    }

    pub fn is_throttling(&self) -> bool {
        self.inner.throttle.load(Ordering::Relaxed)
    }

    /// Whether any worker has exceeded its budget so far
    pub fn overhead_detected(&self) -> bool {
        self.inner.first_detected.load(Ordering::Relaxed)
    }

    /// Register the callback run on the first overhead detection
    ///
    /// Only one listener can be installed; returns false if one already was.
    pub fn on_overhead_detected<F>(&self, listener: F) -> bool
    where
        F: Fn(&OverheadGovernor) + Send + Sync + 'static,
    {
        self.inner.listener.set(Box::new(listener)).is_ok()
    }

    pub fn max_budget_ns(&self) -> u64 {
        self.inner.max_budget_ns
    }

    pub fn target_percent(&self) -> f64 {
        self.inner.target_percent
    }

    fn now_ns(&self) -> u64 {
        self.inner.clock.now_ns()
    }

    fn notify_first_detection(&self) {
        if self
            .inner
            .first_detected
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        tracing::warn!(
            target_percent = self.inner.target_percent,
            max_budget_ns = self.inner.max_budget_ns,
            throttling = self.is_throttling(),
            "instrumentation overhead exceeded its budget"
        );
        if let Some(listener) = self.inner.listener.get() {
            listener(self);
        }
    }
}

impl std::fmt::Debug for OverheadGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverheadGovernor")
            .field("target_percent", &self.inner.target_percent)
            .field("max_budget_ns", &self.inner.max_budget_ns)
            .field("throttle", &self.is_throttling())
            .field("overhead_detected", &self.overhead_detected())
            .finish()
    }
}

/// Per-worker admission control
#[derive(Debug)]
pub enum OverheadTracker {
    /// Target of 100% or more: every operation runs, nothing is measured
    Disabled,
    Active(ActiveTracker),
}

impl OverheadTracker {
    /// Run `op` unless this worker is over budget and throttling is enabled
    ///
    /// Returns `None` when the operation was skipped. Nested calls made from
    /// inside `op` always run and are accounted as part of the outer call.
    pub fn run_if_no_overhead<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        match self {
            OverheadTracker::Disabled => Some(op()),
            OverheadTracker::Active(tracker) => tracker.run_if_no_overhead(op),
        }
    }

    /// Operations run through this tracker
    pub fn executed(&self) -> u64 {
        match self {
            OverheadTracker::Disabled => 0,
            OverheadTracker::Active(tracker) => tracker.executed.get(),
        }
    }

    /// Operations skipped by throttling
    pub fn skipped(&self) -> u64 {
        match self {
            OverheadTracker::Disabled => 0,
            OverheadTracker::Active(tracker) => tracker.skipped.get(),
        }
    }

    /// Currently accumulated overhead in nanoseconds
    pub fn accumulated_ns(&self) -> u64 {
        match self {
            OverheadTracker::Disabled => 0,
            OverheadTracker::Active(tracker) => tracker.accumulated.get(),
        }
    }
}

pub struct ActiveTracker {
    governor: OverheadGovernor,
    last_time: Cell<u64>,
    accumulated: Cell<u64>,
    in_progress: Cell<bool>,
    local_throttle: Cell<bool>,
    local_first_detected: Cell<bool>,
    executed: Cell<u64>,
    skipped: Cell<u64>,
}

impl ActiveTracker {
    fn run_if_no_overhead<R>(&self, op: impl FnOnce() -> R) -> Option<R> {
        if self.in_progress.get() {
            return Some(op());
        }

        let start = self.governor.now_ns();
        self.restore(start);

        if self.accumulated.get() >= self.governor.max_budget_ns() {
            self.notify_overhead();
            if self.throttling() {
                self.skipped.set(self.skipped.get() + 1);
                return None;
            }
        }

        self.in_progress.set(true);
        let _account = Accounting {
            tracker: self,
            start,
        };
        Some(op())
    }

    /// Leak budget proportionally to the time since the previous invocation
    fn restore(&self, now: u64) {
        let elapsed = now.saturating_sub(self.last_time.get());
        self.last_time.set(now);

        if elapsed >= PERIOD_NS {
            self.accumulated.set(0);
            return;
        }
        let restored = elapsed * self.governor.max_budget_ns() / PERIOD_NS;
        self.accumulated
            .set(self.accumulated.get().saturating_sub(restored));
    }

    fn notify_overhead(&self) {
        if self.local_first_detected.get() {
            return;
        }
        self.local_first_detected.set(true);
        self.governor.notify_first_detection();
    }

    fn throttling(&self) -> bool {
        if self.local_throttle.get() {
            return true;
        }
        let enabled = self.governor.is_throttling();
        if enabled {
            self.local_throttle.set(true);
        }
        enabled
    }
}

impl std::fmt::Debug for ActiveTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTracker")
            .field("accumulated", &self.accumulated.get())
            .field("in_progress", &self.in_progress.get())
            .field("executed", &self.executed.get())
            .field("skipped", &self.skipped.get())
            .finish()
    }
}

/// Adds the measured cost to the bucket, also when the operation unwinds
struct Accounting<'a> {
    tracker: &'a ActiveTracker,
    start: u64,
}

impl Drop for Accounting<'_> {
    fn drop(&mut self) {
        let tracker = self.tracker;
        let elapsed = tracker.governor.now_ns().saturating_sub(self.start);
        let cap = tracker.governor.max_budget_ns().saturating_mul(2);
        let total = tracker.accumulated.get().saturating_add(elapsed).min(cap);
        tracker.accumulated.set(total);
        tracker.executed.set(tracker.executed.get() + 1);
        tracker.in_progress.set(false);
    }
}
