//! Delta compressor: batches contiguous local inserts before they reach
//! the codec.
//!
//! Typing produces a run of single-character inserts; sending each as its
//! own frame wastes the wire. The compressor buffers inserts that land
//! exactly where the previous one ended, and flushes the run as one BATCH
//! frame when the 50 ms window closes, when contiguity breaks, or when
//! the batch would exceed 255 operations. Segments keep their original
//! boundaries so receivers can reconstruct the operation sequence.
//!
//! The struct is a plain state machine; the session's flusher task drives
//! the timer via [`DeltaCompressor::deadline`].

use std::time::Duration;

use tokio::time::Instant;

use scribe_proto::frame::MAX_BATCH_OPS;
use scribe_proto::Op;

/// Default batching window.
pub const BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Byte budget for one pending run; keeps the worst-case BATCH body
/// (opcode + start + count + 255 segment headers) inside the u16 frame
/// limit with room to spare.
const MAX_BATCH_BYTES: usize = 60 * 1024;

/// Accumulates contiguous inserts into pending batches.
pub struct DeltaCompressor {
    window: Duration,
    segments: Vec<String>,
    start: u32,
    /// Position the next insert must have to extend the pending run:
    /// start + sum of buffered byte lengths.
    next_pos: u32,
    /// Sum of buffered segment byte lengths.
    pending_bytes: usize,
    deadline: Option<Instant>,
}

impl DeltaCompressor {
    pub fn new() -> Self {
        Self::with_window(BATCH_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            segments: Vec::new(),
            start: 0,
            next_pos: 0,
            pending_bytes: 0,
            deadline: None,
        }
    }

    /// Buffer a local insert. Returns any operations that must go on the
    /// wire immediately (a non-contiguous run flushed early, or a batch
    /// that hit the 255-op or byte-budget ceiling).
    pub fn push_insert(&mut self, pos: u32, text: &str) -> Vec<Op> {
        let mut out = Vec::new();
        let breaks_run =
            pos != self.next_pos || self.pending_bytes + text.len() > MAX_BATCH_BYTES;
        if !self.segments.is_empty() && breaks_run {
            if let Some(op) = self.flush() {
                out.push(op);
            }
        }
        if self.segments.is_empty() {
            self.start = pos;
            self.next_pos = pos;
            self.deadline = Some(Instant::now() + self.window);
        }
        self.segments.push(text.to_owned());
        self.next_pos += text.len() as u32;
        self.pending_bytes += text.len();
        if self.segments.len() >= MAX_BATCH_OPS {
            if let Some(op) = self.flush() {
                out.push(op);
            }
        }
        out
    }

    /// Flush the pending run: one buffered op becomes an INSERT, two or
    /// more become a single BATCH preserving each original segment.
    pub fn flush(&mut self) -> Option<Op> {
        self.deadline = None;
        self.pending_bytes = 0;
        match self.segments.len() {
            0 => None,
            1 => Some(Op::Insert {
                pos: self.start,
                text: self.segments.drain(..).next()?,
            }),
            _ => Some(Op::Batch {
                start: self.start,
                segments: std::mem::take(&mut self.segments),
            }),
        }
    }

    /// Flush only if the armed deadline is due at `now`. The flusher task
    /// calls this when its sleep fires; a batch that was flushed early and
    /// re-armed later keeps waiting.
    pub fn flush_due(&mut self, now: Instant) -> Option<Op> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// When the pending run must flush, if a run is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of buffered operations.
    pub fn pending_ops(&self) -> usize {
        self.segments.len()
    }
}

impl Default for DeltaCompressor {
    fn default() -> Self {
        Self::new()
    }
}
