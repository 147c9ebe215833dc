//! Per-worker stack of active insertion points
//!
//! Each `insert_enter` pushes the fragment correlated with the body being run
//! (or `None` when the key had nothing captured) and the matching
//! `insert_exit` pops it. The top of the stack is what new captures on this
//! worker link to.
//!
//! The linkage is owned by its worker. In "track every worker" mode a reader on
//! another thread may also peek at the top, so the stack sits behind a mutex
//! that is uncontended in practice.

use crate::captured_stack::CapturedStack;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// LIFO of correlated fragments for one worker
#[derive(Debug, Default)]
pub struct Linkage {
    entries: Mutex<Vec<Option<Arc<CapturedStack>>>>,
}

impl Linkage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Arc<CapturedStack>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stack: Option<Arc<CapturedStack>>) {
        self.lock().push(stack);
    }

    /// Remove the innermost entry; popping an empty linkage is a no-op
    pub fn pop(&self) -> Option<Arc<CapturedStack>> {
        self.lock().pop().flatten()
    }

    /// The innermost fragment, if any entry is present and non-empty
    pub fn top(&self) -> Option<Arc<CapturedStack>> {
        self.lock().last().cloned().flatten()
    }

    /// Number of entries, absent ones included
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Identity of a worker thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub thread: ThreadId,
    pub name: Option<String>,
}

impl WorkerId {
    /// Identity of the calling thread
    pub fn current() -> Self {
        let current = thread::current();
        WorkerId {
            thread: current.id(),
            name: current.name().map(str::to_string),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({:?})", name, self.thread),
            None => write!(f, "{:?}", self.thread),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::stack_source::Snapshot;

    fn stack(name: &str) -> Arc<CapturedStack> {
        Arc::new(CapturedStack::Leaf(Snapshot::from_frames(vec![Frame::call("app", name, 1)])))
    }

    #[test]
    fn test_push_pop_lifo() {
        let linkage = Linkage::new();
        let a = stack("a");
        let b = stack("b");
        linkage.push(Some(a.clone()));
        linkage.push(Some(b.clone()));
        assert!(Arc::ptr_eq(&linkage.top().unwrap(), &b));
        assert!(Arc::ptr_eq(&linkage.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&linkage.top().unwrap(), &a));
        assert_eq!(linkage.depth(), 1);
    }

    #[test]
    fn test_absent_entries_hide_outer_top() {
        let linkage = Linkage::new();
        linkage.push(Some(stack("outer")));
        linkage.push(None);
        assert!(linkage.top().is_none());
        assert_eq!(linkage.depth(), 2);
        linkage.pop();
        assert!(linkage.top().is_some());
    }

    #[test]
    fn test_pop_empty_is_noop() {
        let linkage = Linkage::new();
        assert!(linkage.pop().is_none());
        assert!(linkage.pop().is_none());
        assert!(linkage.is_empty());
    }

    #[test]
    fn test_worker_id_current() {
        let id = thread::Builder::new()
            .name("worker-7".to_string())
            .spawn(WorkerId::current)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(id.name.as_deref(), Some("worker-7"));
        assert!(id.to_string().starts_with("worker-7 ("));
        assert_ne!(id, WorkerId::current());
    }
}
