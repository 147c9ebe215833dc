//! Hilvan - async stack trace correlation across thread hops
//!
//! This library stitches the stack of the code that scheduled a piece of work
//! to the stack of the worker that runs it, so a failure deep inside a
//! callback still shows where the callback came from. Instrumentation stays
//! within a configurable CPU budget through a leaky-bucket governor.

pub mod captured_stack;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod frame;
pub mod governor;
pub mod linkage;
pub mod log_capture;
pub mod registry;
pub mod stack_source;
pub mod throttle_sim; // Deterministic governor experiments
pub mod traced_error;
pub mod wire;

pub use config::{ConfigError, EngineConfig};
pub use engine::{run__capture, CorrelationEngine, EngineBuilder, EngineError, EngineStats};
pub use frame::{Frame, FrameTable};
pub use governor::{OverheadGovernor, OverheadTracker};
pub use linkage::WorkerId;
pub use traced_error::{NativeTrace, TracedError};
