//! Errors that remember where they were created
//!
//! [`NativeTrace`] is the seam the engine uses to read an error's own stack.
//! [`TracedError`] is a ready-made implementation; applications with their own
//! error types can implement the trait on them instead.

use crate::stack_source::{Snapshot, StackSource};
use std::error::Error;
use std::fmt;

/// An error carrying the stack of its creation site
pub trait NativeTrace {
    fn native_trace(&self) -> &Snapshot;
}

/// Error with a message, a creation-site snapshot and an optional cause
#[derive(Debug)]
pub struct TracedError {
    message: String,
    trace: Snapshot,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl TracedError {
    /// Create an error capturing the calling thread's stack
    #[inline(never)]
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_snapshot(message, Snapshot::capture())
    }

    /// Create an error using `source` to snapshot the stack
    pub fn captured_by(message: impl Into<String>, source: &dyn StackSource) -> Self {
        Self::with_snapshot(message, source.snapshot())
    }

    pub fn with_snapshot(message: impl Into<String>, trace: Snapshot) -> Self {
        TracedError {
            message: message.into(),
            trace,
            source: None,
        }
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for TracedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

impl NativeTrace for TracedError {
    fn native_trace(&self) -> &Snapshot {
        &self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::io;

    #[test]
    fn test_display_and_message() {
        let err = TracedError::with_snapshot("disk full", Snapshot::from_frames(Vec::new()));
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(err.message(), "disk full");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_source_chain() {
        let err = TracedError::with_snapshot("write failed", Snapshot::from_frames(Vec::new()))
            .with_source(io::Error::new(io::ErrorKind::Other, "disk full"));
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn test_captured_by_custom_source() {
        let source = || vec![Frame::call("app", "save", 12)];
        let err = TracedError::captured_by("oops", &source);
        assert_eq!(err.native_trace().frames().len(), 1);
        assert_eq!(err.native_trace().frames()[0].operation_name(), Some("save"));
    }

    #[test]
    fn test_new_captures_live_stack() {
        let err = TracedError::new("live");
        assert!(!err.native_trace().is_resolved());
        assert!(!err.native_trace().is_empty());
    }
}
