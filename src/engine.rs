//! Correlation engine: capture, insert and query operations
//!
//! Instrumented code calls into the engine at three kinds of sites:
//!
//! - **capture points** ([`CorrelationEngine::capture`]) where work is handed
//!   off, e.g. when a task is scheduled. The current stack is stored under a
//!   correlation key (the task object).
//! - **insert points** ([`CorrelationEngine::insert_region`] or the
//!   `insert_enter`/`insert_exit` pair) where the handed-off work runs. The
//!   fragment stored under the key becomes the worker's active linkage, so
//!   captures made while the body runs chain back to the scheduling site.
//! - **queries** that stitch the chain into one async stack trace.
//!
//! # Design
//!
//! ```text
//!   thread A                          thread B
//!   ────────                          ────────
//!   capture(task) ──► general registry ──► insert_enter(task)
//!                     (weak, identity)         │ linkage.push(stack)
//!                                              ▼
//!                                         run__capture(body)
//!                                              │ capture(next) links to top
//!                                              ▼
//!                                         insert_exit(task)
//!                                              linkage.pop()
//! ```
//!
//! Every operation runs through the worker's overhead tracker and under
//! `catch_unwind`. An internal failure is reported once and disables the
//! engine; the instrumented program never observes an error or a panic from
//! here.

use crate::captured_stack::{reconstruct, CapturedStack, FlattenPolicy, FrameFilter};
use crate::clock::{default_clock, Clock};
use crate::config::EngineConfig;
use crate::frame::{Frame, FrameTable};
use crate::governor::{OverheadGovernor, OverheadTracker};
use crate::linkage::{Linkage, WorkerId};
use crate::registry::IdentityWeakRegistry;
use crate::stack_source::{BacktraceSource, Snapshot, StackSource};
use crate::traced_error::{NativeTrace, TracedError};
use crate::wire::{self, WireError};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;

/// Type-erased correlation key
pub type CorrelationKey = dyn Any + Send + Sync;

type StackRegistry = IdentityWeakRegistry<CorrelationKey, Arc<CapturedStack>>;

/// Internal failures; any of them disables the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("coroutine owner chain longer than {limit} steps")]
    OwnerChainTooLong { limit: usize },

    #[error("panic in {operation}: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },

    #[error("failed to encode captured stack: {0}")]
    Wire(#[from] WireError),
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

struct WorkerContext {
    tracker: OverheadTracker,
    suppressed: Cell<bool>,
    linkage: Arc<Linkage>,
}

/// A worker context, valid while its engine is alive
struct WorkerSlot {
    engine: Weak<()>,
    context: Rc<WorkerContext>,
}

thread_local! {
    static WORKERS: RefCell<HashMap<u64, WorkerSlot>> = RefCell::new(HashMap::new());
}

enum Tracked {
    Done,
    Skipped,
    Unavailable,
}

/// Restores the suppression flag when an operation ends
struct Suppress<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> Suppress<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Suppress { flag, previous }
    }
}

impl Drop for Suppress<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Marker frame wrapping every correlated body
///
/// Reconstruction cuts a worker's stack right below this frame, so the part of
/// the stack that belongs to the scheduler is replaced by the captured one.
/// Instrumentors that drive `insert_enter`/`insert_exit` themselves must run
/// the body through this function.
#[inline(never)]
#[allow(non_snake_case)]
pub fn run__capture<R>(body: impl FnOnce() -> R) -> R {
    // black_box keeps this call from becoming a tail call that drops the frame
    std::hint::black_box(body())
}

struct ExitGuard<'a, K: Any + Send + Sync> {
    engine: &'a CorrelationEngine,
    key: &'a Arc<K>,
}

impl<K: Any + Send + Sync> Drop for ExitGuard<'_, K> {
    fn drop(&mut self) {
        self.engine.insert_exit(self.key);
    }
}

/// Builder for [`CorrelationEngine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    source: Option<Arc<dyn StackSource>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source of the overhead governor
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where stack snapshots come from
    pub fn stack_source(mut self, source: Arc<dyn StackSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> CorrelationEngine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(default_clock);
        let governor = OverheadGovernor::with_clock(config.overhead_percent, clock);
        governor.set_throttle(config.throttle_when_overhead);

        CorrelationEngine {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            enabled: AtomicBool::new(config.enabled),
            failure_reported: AtomicBool::new(false),
            governor,
            source: self.source.unwrap_or_else(|| Arc::new(BacktraceSource)),
            filter: config.frame_filter(),
            flatten: config.flatten_policy(),
            general: IdentityWeakRegistry::with_sweep_interval(config.sweep_interval),
            errors: IdentityWeakRegistry::with_sweep_interval(config.sweep_interval),
            workers: IdentityWeakRegistry::with_sweep_interval(config.sweep_interval),
            config,
        }
    }
}

/// Registry sizes, dead slots included until swept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub general_entries: usize,
    pub error_entries: usize,
    pub tracked_workers: usize,
}

/// Async stack trace correlation engine
pub struct CorrelationEngine {
    id: u64,
    alive: Arc<()>,
    config: EngineConfig,
    enabled: AtomicBool,
    failure_reported: AtomicBool,
    governor: OverheadGovernor,
    source: Arc<dyn StackSource>,
    filter: FrameFilter,
    flatten: FlattenPolicy,
    general: StackRegistry,
    errors: StackRegistry,
    workers: IdentityWeakRegistry<Linkage, WorkerId>,
}

fn erase<K: Any + Send + Sync>(key: &Arc<K>) -> Arc<CorrelationKey> {
    key.clone()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl CorrelationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Process-wide engine configured from `HILVAN_*` environment variables
    ///
    /// An invalid environment is reported and the defaults are used instead.
    pub fn global() -> &'static CorrelationEngine {
        static GLOBAL: OnceLock<CorrelationEngine> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = EngineConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid environment configuration, using defaults");
                EngineConfig::default()
            });
            CorrelationEngine::new(config)
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn governor(&self) -> &OverheadGovernor {
        &self.governor
    }

    /// Snapshot the calling thread's stack with this engine's source
    pub fn snapshot(&self) -> Snapshot {
        self.source.snapshot()
    }

    /// Recognizes the instrumentation's own frames
    pub fn frame_filter(&self) -> &FrameFilter {
        &self.filter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn capturing on or off; idempotent
    ///
    /// Insert points keep pushing and popping on workers that already have a
    /// linkage while the engine is off, so a region that straddles the switch
    /// leaves no stale fragment behind.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------
    // Worker contexts
    // ---------------------------------------------------------------

    fn context(&self) -> Option<Rc<WorkerContext>> {
        WORKERS
            .try_with(|workers| {
                if let Some(context) = self.existing_context() {
                    return Some(context);
                }
                let context = Rc::new(self.new_context());
                let mut workers = workers.try_borrow_mut().ok()?;
                // Contexts of dropped engines are released outside the borrow
                let stale: Vec<WorkerSlot> = {
                    let dead: Vec<u64> = workers
                        .iter()
                        .filter(|(_, slot)| slot.engine.strong_count() == 0)
                        .map(|(id, _)| *id)
                        .collect();
                    dead.iter().filter_map(|id| workers.remove(id)).collect()
                };
                workers.insert(
                    self.id,
                    WorkerSlot {
                        engine: Arc::downgrade(&self.alive),
                        context: Rc::clone(&context),
                    },
                );
                drop(workers);
                drop(stale);
                Some(context)
            })
            .ok()
            .flatten()
    }

    /// The calling worker's context, without creating one
    fn existing_context(&self) -> Option<Rc<WorkerContext>> {
        WORKERS
            .try_with(|workers| {
                workers
                    .try_borrow()
                    .ok()
                    .and_then(|workers| workers.get(&self.id).map(|slot| Rc::clone(&slot.context)))
            })
            .ok()
            .flatten()
    }

    fn new_context(&self) -> WorkerContext {
        let linkage = Arc::new(Linkage::new());
        if self.config.track_all_workers {
            self.workers.put(&linkage, WorkerId::current());
        }
        WorkerContext {
            tracker: self.governor.tracker(),
            suppressed: Cell::new(false),
            linkage,
        }
    }

    fn handle_failure(&self, error: EngineError) {
        self.enabled.store(false, Ordering::Relaxed);
        if !self.failure_reported.swap(true, Ordering::Relaxed) {
            tracing::error!(error = %error, "internal failure, async stack capture disabled");
        }
    }

    /// Run a hot-path operation under the governor and the failure boundary
    fn run_tracked(
        &self,
        operation: &'static str,
        op: impl FnOnce(&WorkerContext) -> Result<(), EngineError>,
    ) -> Tracked {
        if !self.is_enabled() {
            return Tracked::Unavailable;
        }
        let Some(context) = self.context() else {
            return Tracked::Unavailable;
        };
        let _suppress = Suppress::enter(&context.suppressed);

        let outcome = context
            .tracker
            .run_if_no_overhead(|| panic::catch_unwind(AssertUnwindSafe(|| op(&context))));
        match outcome {
            None => Tracked::Skipped,
            Some(Ok(Ok(()))) => Tracked::Done,
            Some(Ok(Err(error))) => {
                self.handle_failure(error);
                Tracked::Unavailable
            }
            Some(Err(payload)) => {
                self.handle_failure(EngineError::Panicked {
                    operation,
                    message: panic_message(payload.as_ref()),
                });
                Tracked::Unavailable
            }
        }
    }

    /// Run a query under the failure boundary, without overhead accounting
    fn guarded<R>(
        &self,
        operation: &'static str,
        op: impl FnOnce(Option<&WorkerContext>) -> Result<R, EngineError>,
    ) -> Option<R> {
        if !self.is_enabled() {
            return None;
        }
        let context = self.context();
        let _suppress = context.as_deref().map(|context| Suppress::enter(&context.suppressed));

        match panic::catch_unwind(AssertUnwindSafe(|| op(context.as_deref()))) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.handle_failure(error);
                None
            }
            Err(payload) => {
                self.handle_failure(EngineError::Panicked {
                    operation,
                    message: panic_message(payload.as_ref()),
                });
                None
            }
        }
    }

    // ---------------------------------------------------------------
    // Hot path
    // ---------------------------------------------------------------

    /// Store the caller's stack under `key`
    ///
    /// If the worker is running a correlated body, the new fragment is linked
    /// to the fragment of that body.
    #[inline(never)]
    pub fn capture<K: Any + Send + Sync>(&self, key: &Arc<K>) {
        let key = erase(key);
        self.run_tracked("capture", |context| {
            let snapshot = self.source.snapshot();
            let stack = CapturedStack::build(snapshot, context.linkage.top(), self.flatten, &self.filter);
            tracing::trace!(depth = stack.depth(), "captured stack");
            self.general.put(&key, stack);
            Ok(())
        });
    }

    /// Remember the worker's active linkage for a newly created error
    ///
    /// Ignored while the worker is inside another engine operation.
    pub fn capture_throwable<E: Any + Send + Sync>(&self, error: &Arc<E>) {
        if !self.config.capture_errors || !self.is_enabled() {
            return;
        }
        let Some(context) = self.context() else {
            return;
        };
        if context.suppressed.get() {
            return;
        }
        let key = erase(error);
        self.run_tracked("capture_throwable", |context| {
            if let Some(top) = context.linkage.top() {
                self.errors.put(&key, top);
            }
            Ok(())
        });
    }

    /// Make the fragment stored under `key` the worker's active linkage
    ///
    /// Must be paired with exactly one [`insert_exit`](Self::insert_exit).
    pub fn insert_enter<K: Any + Send + Sync>(&self, key: &Arc<K>) {
        if !self.is_enabled() {
            if let Some(context) = self.existing_context() {
                context.linkage.push(None);
            }
            return;
        }
        let entered = self.run_tracked("insert_enter", |context| {
            let stack = self.general.get(key);
            context.linkage.push(stack);
            tracing::trace!(depth = context.linkage.depth(), "insert enter");
            Ok(())
        });
        // A skipped enter still pushes so that the matching exit stays balanced
        if let Tracked::Skipped = entered {
            if let Some(context) = self.context() {
                context.linkage.push(None);
            }
        }
    }

    /// Drop the innermost active linkage entry; tolerant of an empty linkage
    pub fn insert_exit<K: Any + Send + Sync>(&self, _key: &Arc<K>) {
        if !self.is_enabled() {
            if let Some(context) = self.existing_context() {
                context.linkage.pop();
            }
            return;
        }
        let exited = self.run_tracked("insert_exit", |context| {
            context.linkage.pop();
            tracing::trace!(depth = context.linkage.depth(), "insert exit");
            Ok(())
        });
        if let Tracked::Skipped = exited {
            if let Some(context) = self.context() {
                context.linkage.pop();
            }
        }
    }

    /// Run `body` as the continuation of the work captured under `key`
    ///
    /// The linkage is restored on every exit path, including unwinding.
    #[inline(never)]
    pub fn insert_region<K, R>(&self, key: &Arc<K>, body: impl FnOnce() -> R) -> R
    where
        K: Any + Send + Sync,
    {
        self.insert_enter(key);
        let _exit = ExitGuard { engine: self, key };
        run__capture(body)
    }

    /// Follow `predecessor` from `key` to the owner of a suspended computation
    ///
    /// Stops at the first predecessor satisfying `is_terminal` (which is
    /// returned) or at the last value whose predecessor is `None`. A walk longer
    /// than `max_owner_walk` steps is treated as a cycle: the engine disables
    /// itself and `key` is returned.
    pub fn coroutine_owner<T, P, F>(&self, key: T, predecessor: P, is_terminal: F) -> T
    where
        T: Clone,
        P: Fn(&T) -> Option<T>,
        F: Fn(&T) -> bool,
    {
        let limit = self.config.max_owner_walk;
        let owner = self.guarded("coroutine_owner", |_| {
            let mut current = key.clone();
            for _ in 0..limit {
                match predecessor(&current) {
                    None => return Ok(current),
                    Some(caller) if is_terminal(&caller) => return Ok(caller),
                    Some(caller) => current = caller,
                }
            }
            Err(EngineError::OwnerChainTooLong { limit })
        });
        owner.unwrap_or(key)
    }

    /// Create an error that remembers both its own stack and the async linkage
    #[inline(never)]
    pub fn new_error(&self, message: impl Into<String>) -> Arc<TracedError> {
        let error = Arc::new(TracedError::captured_by(message, self.source.as_ref()));
        self.capture_throwable(&error);
        error
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    fn encode(&self, stack: Option<Arc<CapturedStack>>, limit: usize) -> Result<Option<Vec<u8>>, EngineError> {
        let frames = reconstruct(stack.as_ref(), limit, &self.filter);
        if frames.is_empty() {
            return Ok(None);
        }
        Ok(Some(wire::encode(&frames)?))
    }

    /// Reconstructed async trace of the current worker's active linkage
    pub fn current_frames(&self, limit: usize) -> Option<Vec<Frame>> {
        self.guarded("current_frames", |context| {
            let top = context.and_then(|context| context.linkage.top());
            Ok(top.map(|top| reconstruct(Some(&top), limit, &self.filter)))
        })
        .flatten()
    }

    /// Wire encoding of [`current_frames`](Self::current_frames)
    pub fn current_captured_stack(&self, limit: usize) -> Option<Vec<u8>> {
        self.guarded("current_captured_stack", |context| {
            let top = context.and_then(|context| context.linkage.top());
            self.encode(top, limit)
        })
        .flatten()
    }

    /// Wire-encoded async trace of `worker`
    ///
    /// Without `track_all_workers` only the calling worker can be inspected.
    pub fn captured_stack_for_worker(&self, worker: &WorkerId, limit: usize) -> Option<Vec<u8>> {
        self.guarded("captured_stack_for_worker", |context| {
            let top = if self.config.track_all_workers {
                self.workers
                    .live_entries()
                    .into_iter()
                    .find(|(_, id)| id == worker)
                    .and_then(|(linkage, _)| linkage.top())
            } else if *worker == WorkerId::current() {
                context.and_then(|context| context.linkage.top())
            } else {
                None
            };
            self.encode(top, limit)
        })
        .flatten()
    }

    /// Wire-encoded async traces of every worker that has one
    ///
    /// Without `track_all_workers` only the calling worker is reported.
    pub fn all_captured_stacks(&self, limit: usize) -> HashMap<WorkerId, Vec<u8>> {
        self.guarded("all_captured_stacks", |context| {
            let mut stacks = HashMap::new();
            if self.config.track_all_workers {
                for (linkage, worker) in self.workers.live_entries() {
                    if let Some(encoded) = self.encode(linkage.top(), limit)? {
                        stacks.insert(worker, encoded);
                    }
                }
            } else if let Some(context) = context {
                if let Some(encoded) = self.encode(context.linkage.top(), limit)? {
                    stacks.insert(WorkerId::current(), encoded);
                }
            }
            Ok(stacks)
        })
        .unwrap_or_default()
    }

    /// Structured frame table of the trace stored under `key`
    pub fn related_stack<K: Any + Send + Sync>(&self, key: &Arc<K>, limit: usize) -> Option<FrameTable> {
        self.guarded("related_stack", |_| {
            Ok(self.general.get(key).map(|stack| {
                FrameTable::from_frames(&reconstruct(Some(&stack), limit, &self.filter))
            }))
        })
        .flatten()
    }

    /// Stack of `error` extended across the async hops that led to it
    ///
    /// Falls back to the error's own frames when nothing was recorded for it or
    /// the engine is disabled.
    pub fn async_stack_trace<E>(&self, error: &Arc<E>) -> Vec<Frame>
    where
        E: NativeTrace + Any + Send + Sync,
    {
        let native = || error.native_trace().frames().to_vec();
        let traced = self.guarded("async_stack_trace", |_| {
            let Some(parent) = self.errors.get(error) else {
                return Ok(None);
            };
            let own = Snapshot::from_frames(Arc::clone(error.native_trace().frames()));
            let stack = CapturedStack::build(own, Some(parent), self.flatten, &self.filter);
            Ok(Some(reconstruct(
                Some(&stack),
                self.config.error_trace_depth_limit,
                &self.filter,
            )))
        });
        traced.flatten().unwrap_or_else(native)
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Entries on the calling worker's linkage
    pub fn linkage_depth(&self) -> usize {
        self.context().map_or(0, |context| context.linkage.depth())
    }

    /// Reclaim registry slots of dead keys; returns how many were dropped
    pub fn sweep(&self) -> usize {
        self.general.sweep() + self.errors.sweep() + self.workers.sweep()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            general_entries: self.general.len(),
            error_entries: self.errors.len(),
            tracked_workers: self.workers.len(),
        }
    }
}

impl Drop for CorrelationEngine {
    fn drop(&mut self) {
        // Other threads release their context on their next context creation
        let released = WORKERS
            .try_with(|workers| workers.try_borrow_mut().ok().and_then(|mut workers| workers.remove(&self.id)))
            .ok()
            .flatten();
        drop(released);
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("governor", &self.governor)
            .field("stats", &self.stats())
            .finish()
    }
}
