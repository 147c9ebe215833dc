//! Stack frames and the structured frame table handed to consumers
//!
//! A [`Frame`] is either a concrete call site or the [`Frame::Boundary`]
//! sentinel that separates two stitched fragments of an async stack trace.
//!
//! Names are stored as `Arc<str>` so that reconstructing a trace (which copies
//! frames out of shared snapshots) only bumps reference counts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Line number used when the source line of a frame is unknown
pub const UNKNOWN_LINE: i32 = -1;

/// A single call site in a captured stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    /// Path of the type or module that declares the operation (e.g. `app::Worker`)
    pub declaring_name: Arc<str>,
    /// Function or method name (e.g. `run`)
    pub operation_name: Arc<str>,
    /// Source file, when symbolization found one. Not carried on the wire.
    pub file_name: Option<Arc<str>>,
    /// Source line, or [`UNKNOWN_LINE`]
    pub line: i32,
}

/// A frame of a reconstructed trace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    /// A real call site
    Call(CallSite),
    /// Logical gap between two correlated fragments
    Boundary,
}

impl Frame {
    /// Create a call frame without file information
    pub fn call(declaring_name: &str, operation_name: &str, line: i32) -> Self {
        Frame::Call(CallSite {
            declaring_name: Arc::from(declaring_name),
            operation_name: Arc::from(operation_name),
            file_name: None,
            line,
        })
    }

    /// Build a call frame from a fully qualified symbol name
    ///
    /// The symbol is split at its last `::`: `app::Worker::run` becomes
    /// declaring name `app::Worker` and operation name `run`. A symbol without
    /// a path separator gets an empty declaring name.
    pub fn from_symbol(symbol: &str, file_name: Option<&str>, line: Option<u32>) -> Self {
        let (declaring, operation) = split_symbol(symbol);
        Frame::Call(CallSite {
            declaring_name: Arc::from(declaring),
            operation_name: Arc::from(operation),
            file_name: file_name.map(Arc::from),
            line: line
                .and_then(|l| i32::try_from(l).ok())
                .unwrap_or(UNKNOWN_LINE),
        })
    }

    /// Returns true for the boundary sentinel
    pub fn is_boundary(&self) -> bool {
        matches!(self, Frame::Boundary)
    }

    /// The call site, unless this is a boundary
    pub fn call_site(&self) -> Option<&CallSite> {
        match self {
            Frame::Call(site) => Some(site),
            Frame::Boundary => None,
        }
    }

    /// Operation name, unless this is a boundary
    pub fn operation_name(&self) -> Option<&str> {
        self.call_site().map(|site| &*site.operation_name)
    }

    /// Declaring name, unless this is a boundary
    pub fn declaring_name(&self) -> Option<&str> {
        self.call_site().map(|site| &*site.declaring_name)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Boundary => write!(f, "--- async boundary ---"),
            Frame::Call(site) => {
                if site.declaring_name.is_empty() {
                    write!(f, "{}", site.operation_name)?;
                } else {
                    write!(f, "{}::{}", site.declaring_name, site.operation_name)?;
                }
                match (&site.file_name, site.line) {
                    (Some(file), line) if line >= 0 => write!(f, " ({}:{})", file, line),
                    (Some(file), _) => write!(f, " ({})", file),
                    (None, line) if line >= 0 => write!(f, " (line {})", line),
                    (None, _) => Ok(()),
                }
            }
        }
    }
}

fn split_symbol(symbol: &str) -> (&str, &str) {
    // Closures demangle as `path::{{closure}}`; generic impls may contain `::`
    // inside angle brackets, so only split outside of them.
    let mut depth = 0usize;
    let bytes = symbol.as_bytes();
    let mut split_at = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split_at = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    match split_at {
        Some(idx) => (&symbol[..idx], &symbol[idx + 2..]),
        None => ("", symbol),
    }
}

/// One row of a structured frame table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRow {
    pub declaring_name: String,
    pub file_name: Option<String>,
    pub operation_name: String,
    pub line: String,
}

/// Structured form of a reconstructed trace
///
/// Boundaries are represented by `None` rows so that consumers can render
/// the gap between fragments however they like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTable {
    pub rows: Vec<Option<FrameRow>>,
}

impl FrameTable {
    pub fn from_frames(frames: &[Frame]) -> Self {
        let rows = frames
            .iter()
            .map(|frame| {
                frame.call_site().map(|site| FrameRow {
                    declaring_name: site.declaring_name.to_string(),
                    file_name: site.file_name.as_deref().map(str::to_string),
                    operation_name: site.operation_name.to_string(),
                    line: site.line.to_string(),
                })
            })
            .collect();
        FrameTable { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
