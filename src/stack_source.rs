//! Live stack snapshots
//!
//! Capturing a stack is on the hot path of every capture point, symbolizing it
//! is not. [`BacktraceSource`] records raw instruction pointers with
//! `backtrace::Backtrace::new_unresolved` and a [`Snapshot`] resolves them into
//! [`Frame`]s the first time somebody reads it. Most snapshots are never read.
//!
//! Tests and embedders can supply their own source: any
//! `Fn() -> Vec<Frame> + Send + Sync` closure is a [`StackSource`].

use crate::frame::Frame;
use backtrace::Backtrace;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// The frames of one stack capture, innermost first
pub struct Snapshot {
    raw: Option<Backtrace>,
    frames: OnceLock<Arc<[Frame]>>,
}

impl Snapshot {
    /// Capture the calling thread's stack without symbolizing it
    #[inline(never)]
    pub fn capture() -> Self {
        Snapshot {
            raw: Some(Backtrace::new_unresolved()),
            frames: OnceLock::new(),
        }
    }

    /// Build an already resolved snapshot
    pub fn from_frames(frames: impl Into<Arc<[Frame]>>) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(frames.into());
        Snapshot {
            raw: None,
            frames: resolved,
        }
    }

    /// Resolved frames, symbolizing on first access
    pub fn frames(&self) -> &Arc<[Frame]> {
        self.frames.get_or_init(|| match &self.raw {
            Some(raw) => resolve(raw),
            None => Arc::from(Vec::new()),
        })
    }

    /// Whether the frames have been symbolized already
    pub fn is_resolved(&self) -> bool {
        self.frames.get().is_some()
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }
}

fn resolve(raw: &Backtrace) -> Arc<[Frame]> {
    let mut trace = raw.clone();
    trace.resolve();

    let mut frames = Vec::with_capacity(trace.frames().len());
    for frame in trace.frames() {
        let symbols = frame.symbols();
        if symbols.is_empty() {
            frames.push(Frame::from_symbol("<unknown>", None, None));
            continue;
        }
        // Inlined calls show up as several symbols of one physical frame
        for symbol in symbols {
            let name = symbol
                .name()
                .map(|name| format!("{:#}", name))
                .unwrap_or_else(|| "<unknown>".to_string());
            let file = symbol.filename().map(|path| path.display().to_string());
            frames.push(Frame::from_symbol(&name, file.as_deref(), symbol.lineno()));
        }
    }
    Arc::from(frames)
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frames.get() {
            Some(frames) => f.debug_struct("Snapshot").field("frames", frames).finish(),
            None => f
                .debug_struct("Snapshot")
                .field("unresolved", &self.raw.as_ref().map_or(0, |raw| raw.frames().len()))
                .finish(),
        }
    }
}

/// Something that can snapshot the calling thread's stack
pub trait StackSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Captures real stacks through the `backtrace` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceSource;

impl StackSource for BacktraceSource {
    #[inline(never)]
    fn snapshot(&self) -> Snapshot {
        Snapshot::capture()
    }
}

impl<F> StackSource for F
where
    F: Fn() -> Vec<Frame> + Send + Sync,
{
    fn snapshot(&self) -> Snapshot {
        Snapshot::from_frames(self())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here() -> Snapshot {
        BacktraceSource.snapshot()
    }

    #[test]
    fn test_from_frames_is_resolved() {
        let snapshot = Snapshot::from_frames(vec![Frame::call("a", "b", 1)]);
        assert!(snapshot.is_resolved());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.frames()[0], Frame::call("a", "b", 1));
    }

    #[test]
    fn test_capture_is_lazy() {
        let snapshot = capture_here();
        assert!(!snapshot.is_resolved());
        assert!(!snapshot.is_empty());
        assert!(snapshot.is_resolved());
    }

    #[test]
    fn test_capture_resolves_caller() {
        let snapshot = capture_here();
        let found = snapshot
            .frames()
            .iter()
            .filter_map(Frame::operation_name)
            .any(|name| name == "capture_here");
        assert!(found, "frames: {:?}", snapshot.frames());
    }

    #[test]
    fn test_frames_resolved_once() {
        let snapshot = capture_here();
        let first = Arc::clone(snapshot.frames());
        let second = Arc::clone(snapshot.frames());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_closure_source() {
        let source = || vec![Frame::call("app", "main", 3), Frame::call("app", "run", 9)];
        let snapshot = source.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.frames()[1].operation_name(), Some("run"));
    }

    #[test]
    fn test_debug_does_not_resolve() {
        let snapshot = capture_here();
        let rendered = format!("{:?}", snapshot);
        assert!(rendered.contains("unresolved"));
        assert!(!snapshot.is_resolved());
    }
}
