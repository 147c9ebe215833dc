//! Captured stack fragments and async trace reconstruction
//!
//! A [`CapturedStack`] is one fragment of a logical call stack. A fragment
//! captured while the worker was running a correlated body is `Linked` to the
//! fragment that was active when the body was scheduled, forming a chain that
//! reaches back across every thread hop.
//!
//! # Reconstruction
//!
//! ```text
//! Linked(worker frames)                 ─┐
//!   frame 0   app::handler::on_message   │ kept
//!   frame 1   hilvan::engine::run__capture
//!   frame 2   hilvan::engine::insert_region  ◄ end = i + 2
//!   frame 3   std::thread::...           ─┘ dropped (scheduler plumbing)
//!   └─ parent: Leaf(spawn site frames)  ── kept in full, chain ends
//!
//! result: [on_message, run__capture, insert_region, BOUNDARY, spawn site...]
//! ```
//!
//! Each `Linked` fragment is cut right after the capture-wrapper frame (or at a
//! boundary left by an earlier flattening) and continues with its parent. If
//! the cut point cannot be found the fragment is kept whole and the walk stops.
//!
//! Chains deeper than the flatten threshold are collapsed into a bounded
//! `Flattened` fragment when they are built, so neither memory nor the
//! reconstruction walk grows with the number of hops.

use crate::frame::Frame;
use crate::stack_source::Snapshot;
use std::sync::Arc;

/// Suffix of the function that wraps every correlated body
pub const CAPTURE_WRAPPER_SUFFIX: &str = "__capture";

/// One fragment of a logical call stack
#[derive(Debug)]
pub enum CapturedStack {
    /// A directly captured snapshot with no predecessor
    Leaf(Snapshot),
    /// A snapshot that continues into `parent`
    Linked {
        snapshot: Snapshot,
        parent: Arc<CapturedStack>,
        depth: u32,
    },
    /// Precomputed frames replacing a chain that grew too deep
    Flattened(Arc<[Frame]>),
}

/// When and how deep chains are collapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlattenPolicy {
    /// Chains with a depth above this are flattened
    pub depth: u32,
    /// Maximum number of frames kept by a flattened fragment
    pub frame_cap: usize,
}

impl Default for FlattenPolicy {
    fn default() -> Self {
        FlattenPolicy {
            depth: 100,
            frame_cap: 500,
        }
    }
}

impl CapturedStack {
    /// Build the fragment for `snapshot`, linking it to `parent` when present
    ///
    /// A chain whose depth would exceed `policy.depth` is reconstructed right
    /// away and stored as a `Flattened` fragment.
    pub fn build(
        snapshot: Snapshot,
        parent: Option<Arc<CapturedStack>>,
        policy: FlattenPolicy,
        filter: &FrameFilter,
    ) -> Arc<CapturedStack> {
        let Some(parent) = parent else {
            return Arc::new(CapturedStack::Leaf(snapshot));
        };
        let depth = parent.depth().saturating_add(1);
        let linked = Arc::new(CapturedStack::Linked {
            snapshot,
            parent,
            depth,
        });
        if depth <= policy.depth {
            return linked;
        }

        tracing::trace!(depth, frame_cap = policy.frame_cap, "flattening captured stack");
        let frames = reconstruct(Some(&linked), policy.frame_cap, filter);
        Arc::new(CapturedStack::Flattened(Arc::from(frames)))
    }

    /// Number of `Linked` hops below this fragment
    pub fn depth(&self) -> u32 {
        match self {
            CapturedStack::Leaf(_) | CapturedStack::Flattened(_) => 0,
            CapturedStack::Linked { depth, .. } => *depth,
        }
    }

    /// This fragment's own frames
    pub fn frames(&self) -> &[Frame] {
        match self {
            CapturedStack::Leaf(snapshot) | CapturedStack::Linked { snapshot, .. } => {
                snapshot.frames()
            }
            CapturedStack::Flattened(frames) => frames,
        }
    }

    pub fn parent(&self) -> Option<&Arc<CapturedStack>> {
        match self {
            CapturedStack::Linked { parent, .. } => Some(parent),
            _ => None,
        }
    }
}

/// Recognizes frames that belong to the instrumentation itself
///
/// A frame matches when its qualified name (`declaring::operation`) starts
/// with one of the prefixes.
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    prefixes: Arc<[String]>,
}

impl FrameFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FrameFilter {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_engine_frame(&self, frame: &Frame) -> bool {
        let Some(site) = frame.call_site() else {
            return false;
        };
        self.prefixes.iter().any(|prefix| {
            if site.declaring_name.is_empty() {
                site.operation_name.starts_with(prefix.as_str())
            } else {
                qualified_starts_with(&site.declaring_name, &site.operation_name, prefix)
            }
        })
    }

    /// Drop the leading run of engine frames
    ///
    /// If every frame is an engine frame the slice is returned unchanged.
    pub fn trim_leading<'a>(&self, frames: &'a [Frame]) -> &'a [Frame] {
        match frames.iter().position(|frame| !self.is_engine_frame(frame)) {
            Some(first) => &frames[first..],
            None => frames,
        }
    }
}

fn qualified_starts_with(declaring: &str, operation: &str, prefix: &str) -> bool {
    if prefix.len() <= declaring.len() {
        return declaring.starts_with(prefix);
    }
    let Some(rest) = prefix.strip_prefix(declaring) else {
        return false;
    };
    match rest.strip_prefix("::") {
        Some(op_prefix) => operation.starts_with(op_prefix),
        None => "::".starts_with(rest),
    }
}

/// Position right after the insertion point of a `Linked` fragment
///
/// `None` when neither a capture wrapper nor a boundary is present.
fn insertion_end(frames: &[Frame]) -> Option<usize> {
    frames.iter().enumerate().find_map(|(i, frame)| match frame {
        Frame::Boundary => Some(i),
        Frame::Call(site) if site.operation_name.ends_with(CAPTURE_WRAPPER_SUFFIX) => Some(i + 2),
        Frame::Call(_) => None,
    })
}

/// Stitch the chain starting at `start` into one frame sequence
///
/// Fragments are separated by [`Frame::Boundary`]. The walk stops once more
/// than `limit` frames have been collected and the result is truncated to
/// `limit`.
pub fn reconstruct(start: Option<&Arc<CapturedStack>>, limit: usize, filter: &FrameFilter) -> Vec<Frame> {
    let mut out = Vec::new();
    let mut current = start;

    while let Some(stack) = current {
        if out.len() > limit {
            break;
        }
        let frames = filter.trim_leading(stack.frames());

        let (kept, next) = match stack.as_ref() {
            CapturedStack::Linked { parent, .. } => match insertion_end(frames) {
                Some(end) if end <= frames.len() => (&frames[..end], Some(parent)),
                // Insertion point lost
                _ => (frames, None),
            },
            CapturedStack::Leaf(_) | CapturedStack::Flattened(_) => (frames, None),
        };

        out.extend_from_slice(kept);
        if next.is_some() {
            out.push(Frame::Boundary);
        }
        current = next;
    }

    out.truncate(limit);
    out
}
