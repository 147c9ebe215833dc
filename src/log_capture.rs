//! Console output capture with the stack of every write
//!
//! Each write to stdout or stderr becomes a record holding the bytes written,
//! the regular stack of the writing thread and, when the thread is running a
//! correlated body, the async stack behind it. A front end can then jump from
//! any line of output to the code (and the async history) that produced it.
//!
//! # Record layout
//!
//! ```text
//! i32 BE payload length | payload bytes
//! | regular frames (wire format)
//! | [0x00 boundary | async frames]      only when an async stack exists
//! ```
//!
//! At most [`MAX_RECORD_FRAMES`] frames are written per record.
//!
//! # Backpressure
//!
//! Records go to a bounded lock-free queue (`crossbeam::queue::ArrayQueue`).
//! The writing thread never blocks: when the queue is full the record is
//! dropped and counted.

use crate::engine::CorrelationEngine;
use crate::frame::Frame;
use crate::wire::{self, Reader, WireError};
use crossbeam::queue::ArrayQueue;
use std::cell::Cell;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Frame budget of one record, regular and async frames together
pub const MAX_RECORD_FRAMES: usize = 100;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 4096;

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

/// Errors while building or parsing a log record
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("payload of {len} bytes does not fit a record")]
    PayloadTooLarge { len: usize },

    #[error("negative payload length {len}")]
    NegativeLength { len: i32 },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Destination of a captured write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    /// Anything else; never captured
    Other,
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub payload: Vec<u8>,
    pub regular: Vec<Frame>,
    pub async_frames: Vec<Frame>,
}

impl LogRecord {
    pub fn encode(&self) -> Result<Vec<u8>, LogRecordError> {
        let len = i32::try_from(self.payload.len()).map_err(|_| LogRecordError::PayloadTooLarge {
            len: self.payload.len(),
        })?;

        let mut out = Vec::with_capacity(4 + self.payload.len() + 32 * self.regular.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        wire::write_frames(&mut out, &self.regular)?;
        if !self.async_frames.is_empty() {
            wire::write_frame(&mut out, &Frame::Boundary)?;
            wire::write_frames(&mut out, &self.async_frames)?;
        }
        Ok(out)
    }

    /// Parse a record; frames after the first boundary are the async stack
    pub fn decode(bytes: &[u8]) -> Result<Self, LogRecordError> {
        let mut reader = Reader { bytes, offset: 0 };
        let len = reader.i32()?;
        let len_usize = usize::try_from(len).map_err(|_| LogRecordError::NegativeLength { len })?;
        let payload = reader.take(len_usize)?.to_vec();

        let mut regular = Vec::new();
        let mut async_frames = Vec::new();
        let mut in_async = false;
        while !reader.is_done() {
            let frame = reader.frame()?;
            if !in_async && frame.is_boundary() {
                in_async = true;
                continue;
            }
            if in_async {
                async_frames.push(frame);
            } else {
                regular.push(frame);
            }
        }

        Ok(LogRecord {
            payload,
            regular,
            async_frames,
        })
    }
}

/// Collects records of console writes
pub struct LogCapture {
    engine: Arc<CorrelationEngine>,
    queue: ArrayQueue<Vec<u8>>,
    enabled: AtomicBool,
    failure_reported: AtomicBool,
    total_captured: AtomicU64,
    total_dropped: AtomicU64,
}

impl LogCapture {
    /// Create a capture with room for `capacity` pending records
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(engine: Arc<CorrelationEngine>, capacity: usize) -> Self {
        assert!(capacity > 0, "log capture capacity must be > 0");
        LogCapture {
            engine,
            queue: ArrayQueue::new(capacity),
            enabled: AtomicBool::new(true),
            failure_reported: AtomicBool::new(false),
            total_captured: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record a write of `bytes` to `stream`
    ///
    /// Writes to other streams, empty writes and writes made while this thread
    /// is already capturing are ignored.
    pub fn capture(&self, stream: Stream, bytes: &[u8]) {
        if !self.is_enabled() || stream == Stream::Other || bytes.is_empty() {
            return;
        }
        let Ok(false) = CAPTURING.try_with(|capturing| capturing.replace(true)) else {
            return;
        };
        let _reset = ResetCapturing;

        match self.build_record(bytes) {
            Ok(record) => {
                if self.queue.push(record).is_err() {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.total_captured.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(error) => self.handle_failure(error),
        }
    }

    fn build_record(&self, bytes: &[u8]) -> Result<Vec<u8>, LogRecordError> {
        let snapshot = self.engine.snapshot();
        let mut regular = self.engine.frame_filter().trim_leading(snapshot.frames()).to_vec();
        regular.truncate(MAX_RECORD_FRAMES);

        let budget = MAX_RECORD_FRAMES - regular.len();
        let async_frames = match budget {
            // No room left for a boundary and async frames
            0 | 1 => Vec::new(),
            budget => self.engine.current_frames(budget - 1).unwrap_or_default(),
        };

        LogRecord {
            payload: bytes.to_vec(),
            regular,
            async_frames,
        }
        .encode()
    }

    fn handle_failure(&self, error: LogRecordError) {
        self.enabled.store(false, Ordering::Relaxed);
        if !self.failure_reported.swap(true, Ordering::Relaxed) {
            tracing::warn!(error = %error, "cannot capture console output, log capture disabled");
        }
    }

    /// Take the oldest pending record
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.queue.pop()
    }

    /// Take up to `max` pending records
    pub fn drain(&self, max: usize) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.queue.pop()).take(max).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn total_captured(&self) -> u64 {
        self.total_captured.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCapture")
            .field("enabled", &self.is_enabled())
            .field("pending", &self.pending())
            .field("total_captured", &self.total_captured())
            .field("total_dropped", &self.total_dropped())
            .finish()
    }
}

struct ResetCapturing;

impl Drop for ResetCapturing {
    fn drop(&mut self) {
        let _ = CAPTURING.try_with(|capturing| capturing.set(false));
    }
}

/// Writer adapter capturing every successful write
pub struct CapturingWriter<W> {
    inner: W,
    stream: Stream,
    capture: Arc<LogCapture>,
}

impl<W: Write> CapturingWriter<W> {
    pub fn new(inner: W, stream: Stream, capture: Arc<LogCapture>) -> Self {
        CapturingWriter {
            inner,
            stream,
            capture,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CapturingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.capture.capture(self.stream, &buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::stack_source::StackSource;

    fn engine_with_frames(frames: Vec<Frame>) -> Arc<CorrelationEngine> {
        let source: Arc<dyn StackSource> = Arc::new(move || frames.clone());
        Arc::new(
            CorrelationEngine::builder()
                .config(EngineConfig::default())
                .clock(Arc::new(ManualClock::new(0)))
                .stack_source(source)
                .build(),
        )
    }

    #[test]
    fn test_record_layout() {
        let record = LogRecord {
            payload: b"hi".to_vec(),
            regular: vec![Frame::call("a", "b", 1)],
            async_frames: Vec::new(),
        };
        let bytes = record.encode().unwrap();
        assert_eq!(&bytes[..6], &[0, 0, 0, 2, b'h', b'i']);
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_with_async_frames() {
        let record = LogRecord {
            payload: b"line\n".to_vec(),
            regular: vec![Frame::call("app", "log", 3)],
            async_frames: vec![Frame::call("app", "schedule", 1), Frame::Boundary, Frame::call("app", "main", 0)],
        };
        let decoded = LogRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_rejects_negative_length() {
        let err = LogRecord::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, LogRecordError::NegativeLength { len: -1 }));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let err = LogRecord::decode(&[0, 0, 0, 9, b'x']).unwrap_err();
        assert!(matches!(err, LogRecordError::Wire(WireError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_capture_stdout() {
        let engine = engine_with_frames(vec![Frame::call("app", "print_report", 7)]);
        let capture = LogCapture::new(engine, 8);
        capture.capture(Stream::Stdout, b"report\n");

        let record = LogRecord::decode(&capture.pop().unwrap()).unwrap();
        assert_eq!(record.payload, b"report\n");
        assert_eq!(record.regular, vec![Frame::call("app", "print_report", 7)]);
        assert!(record.async_frames.is_empty());
        assert_eq!(capture.total_captured(), 1);
    }

    #[test]
    fn test_ignores_other_streams_and_empty_writes() {
        let capture = LogCapture::new(engine_with_frames(Vec::new()), 8);
        capture.capture(Stream::Other, b"file");
        capture.capture(Stream::Stderr, b"");
        assert_eq!(capture.pending(), 0);
    }

    #[test]
    fn test_async_stack_included_inside_region() {
        let engine = engine_with_frames(vec![Frame::call("app", "here", 1)]);
        let capture = LogCapture::new(engine.clone(), 8);
        let key = Arc::new(());
        engine.capture(&key);
        engine.insert_region(&key, || capture.capture(Stream::Stderr, b"warn"));

        let record = LogRecord::decode(&capture.pop().unwrap()).unwrap();
        assert_eq!(record.regular, vec![Frame::call("app", "here", 1)]);
        assert_eq!(record.async_frames, vec![Frame::call("app", "here", 1)]);
    }

    #[test]
    fn test_frame_budget() {
        let deep: Vec<Frame> = (0..150).map(|i| Frame::call("app", "deep", i)).collect();
        let engine = engine_with_frames(deep);
        let capture = LogCapture::new(engine.clone(), 8);
        let key = Arc::new(());
        engine.capture(&key);
        engine.insert_region(&key, || capture.capture(Stream::Stdout, b"x"));

        let record = LogRecord::decode(&capture.pop().unwrap()).unwrap();
        assert_eq!(record.regular.len(), MAX_RECORD_FRAMES);
        assert!(record.async_frames.is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let capture = LogCapture::new(engine_with_frames(Vec::new()), 2);
        for _ in 0..5 {
            capture.capture(Stream::Stdout, b"x");
        }
        assert_eq!(capture.pending(), 2);
        assert_eq!(capture.total_captured(), 2);
        assert_eq!(capture.total_dropped(), 3);
        assert_eq!(capture.drain(10).len(), 2);
    }

    #[test]
    fn test_reentrant_capture_ignored() {
        let capture = Arc::new(LogCapture::new(engine_with_frames(Vec::new()), 8));
        let inner = capture.clone();
        // A stack source that itself writes to the console
        let noisy: Arc<dyn StackSource> = Arc::new(move || {
            inner.capture(Stream::Stdout, b"nested");
            Vec::new()
        });
        let engine = Arc::new(
            CorrelationEngine::builder()
                .clock(Arc::new(ManualClock::new(0)))
                .stack_source(noisy)
                .build(),
        );
        let outer = LogCapture::new(engine, 8);
        outer.capture(Stream::Stdout, b"outer");
        assert_eq!(outer.pending(), 1);
        assert_eq!(capture.pending(), 0);
    }

    #[test]
    fn test_capturing_writer() {
        let capture = Arc::new(LogCapture::new(engine_with_frames(vec![Frame::call("app", "w", 1)]), 8));
        let mut writer = CapturingWriter::new(Vec::new(), Stream::Stdout, capture.clone());
        writer.write_all(b"hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), b"hello");

        let record = LogRecord::decode(&capture.pop().unwrap()).unwrap();
        assert_eq!(record.payload, b"hello");
    }
}
