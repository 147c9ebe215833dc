//! Timestamp sources for the overhead governor
//!
//! The governor reads the time twice per tracked invocation, so the time source
//! must be cheaper than the work it measures. The default [`CoarseClock`] keeps
//! one shared atomic timestamp that a background thread refreshes every
//! precision interval; a read is a single relaxed load.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ coarse-clock thread (holds Weak<Shared>)     │
//! │   loop {                                     │
//! │     shared = weak.upgrade()? else exit       │
//! │     shared.now.store(origin.elapsed())       │
//! │     sleep(precision)                         │
//! │   }                                          │
//! └──────────────────────────────────────────────┘
//!                       │ AtomicU64 (Relaxed)
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │ worker threads                               │
//! │   governor → clock.now_ns() → load(Relaxed)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The refresh thread exits on its own once the last `CoarseClock` handle is
//! dropped.
//!
//! [`ManualClock`] gives every thread its own timeline so deterministic
//! simulations can run on several workers at once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Default refresh interval of the coarse clock
pub const DEFAULT_PRECISION: Duration = Duration::from_micros(10);

/// A monotonic nanosecond time source
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed origin
    fn now_ns(&self) -> u64;
}

struct CoarseShared {
    now: AtomicU64,
    stopped: AtomicBool,
}

/// Imprecise clock refreshed by a background thread
pub struct CoarseClock {
    shared: Arc<CoarseShared>,
    precision: Duration,
}

impl CoarseClock {
    /// Start a coarse clock refreshed every `precision`
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh thread cannot be spawned.
    pub fn start(precision: Duration) -> io::Result<Self> {
        let shared = Arc::new(CoarseShared {
            now: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        let weak: Weak<CoarseShared> = Arc::downgrade(&shared);
        let origin = Instant::now();

        thread::Builder::new()
            .name("coarse-clock".to_string())
            .spawn(move || loop {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.stopped.load(Ordering::Relaxed) {
                    break;
                }
                shared.now.store(elapsed_ns(origin), Ordering::Relaxed);
                drop(shared);
                thread::sleep(precision);
            })?;

        Ok(CoarseClock { shared, precision })
    }

    pub fn precision(&self) -> Duration {
        self.precision
    }
}

impl Clock for CoarseClock {
    fn now_ns(&self) -> u64 {
        self.shared.now.load(Ordering::Relaxed)
    }
}

impl Drop for CoarseClock {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CoarseClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoarseClock")
            .field("precision", &self.precision)
            .field("now_ns", &self.now_ns())
            .finish()
    }
}

/// Precise clock reading `Instant` on every call
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        elapsed_ns(self.origin)
    }
}

fn elapsed_ns(origin: Instant) -> u64 {
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

static NEXT_MANUAL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static MANUAL_TIME: RefCell<HashMap<u64, u64>> = RefCell::new(HashMap::new());
}

/// Manually advanced clock with one timeline per thread
///
/// Reads are floored to `precision_ns` to mimic a coarse timer; a precision of
/// zero reports the exact manual time.
///
/// # Example
///
/// ```
/// use hilvan::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(2_500);
/// assert_eq!(clock.now_ns(), 2_000);
/// assert_eq!(clock.exact_ns(), 2_500);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    id: u64,
    precision_ns: u64,
}

impl ManualClock {
    pub fn new(precision_ns: u64) -> Self {
        ManualClock {
            id: NEXT_MANUAL_ID.fetch_add(1, Ordering::Relaxed),
            precision_ns,
        }
    }

    /// Advance the calling thread's timeline
    pub fn advance(&self, delta_ns: u64) {
        MANUAL_TIME.with(|times| {
            let mut times = times.borrow_mut();
            let entry = times.entry(self.id).or_insert(0);
            *entry = entry.saturating_add(delta_ns);
        });
    }

    /// Unrounded time of the calling thread's timeline
    pub fn exact_ns(&self) -> u64 {
        MANUAL_TIME.with(|times| times.borrow().get(&self.id).copied().unwrap_or(0))
    }

    pub fn precision_ns(&self) -> u64 {
        self.precision_ns
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        let exact = self.exact_ns();
        if self.precision_ns == 0 {
            exact
        } else {
            exact - exact % self.precision_ns
        }
    }
}

/// Process-wide clock shared by governors that were not given one
///
/// Falls back to [`MonotonicClock`] if the refresh thread cannot be started.
pub fn default_clock() -> Arc<dyn Clock> {
    static DEFAULT: OnceLock<Arc<dyn Clock>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| match CoarseClock::start(DEFAULT_PRECISION) {
            Ok(clock) => Arc::new(clock),
            Err(err) => {
                tracing::warn!(error = %err, "coarse clock unavailable, using monotonic clock");
                Arc::new(MonotonicClock::new())
            }
        })
        .clone()
}
