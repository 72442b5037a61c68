//! Shared document state and the update bridge.
//!
//! [`SharedDocument`] wraps the replicated CRDT document: one text root,
//! byte offsets, all mutation serialized behind an internal lock so a
//! replica can be shared across tasks.
//!
//! [`UpdateBridge`] is the only seam between the document and a transport.
//! It observes the document's update events and forwards every update that
//! did not originate from the transport itself; the transport-applied
//! paths set the `applying_remote` guard for the duration of their
//! transactions. That single filter is what prevents update storms among
//! peers — no sequence numbers, no deduplication.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact,
    Update,
};

use scribe_proto::Op;

/// Document errors. Positional failures are recoverable by design: the
/// caller logs and skips the offending operation.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Position past the end of the document.
    OutOfRange { pos: u32, len: u32 },
    /// Position inside a multi-byte character.
    NotCharBoundary(u32),
    /// Update blob failed to decode or apply.
    BadUpdate(String),
    /// Format value was not valid UTF-8.
    BadFormatValue,
    /// Registering the update observer failed.
    Subscribe(String),
    /// A bridge is already attached to this document.
    BridgeAttached,
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocError::OutOfRange { pos, len } => {
                write!(f, "position {pos} out of range (document length {len})")
            }
            DocError::NotCharBoundary(pos) => {
                write!(f, "position {pos} is not a character boundary")
            }
            DocError::BadUpdate(e) => write!(f, "update failed to apply: {e}"),
            DocError::BadFormatValue => write!(f, "format value is not valid UTF-8"),
            DocError::Subscribe(e) => write!(f, "failed to observe document updates: {e}"),
            DocError::BridgeAttached => write!(f, "a bridge is already attached"),
        }
    }
}

impl std::error::Error for DocError {}

struct DocState {
    doc: Doc,
    text: TextRef,
    bridge_sub: Option<yrs::Subscription>,
}

/// The replicated document: a yrs doc with a single text root.
///
/// Merging any set of valid updates, in any order, any number of times,
/// converges — the CRDT guarantee every transport in this crate leans on.
pub struct SharedDocument {
    inner: Mutex<DocState>,
    /// Set while a transport-received update is being applied, so the
    /// bridge never re-forwards it.
    applying_remote: Arc<AtomicBool>,
    /// Set while an edit that already travels on the typed op path is
    /// being applied, so it is not also sent as a raw update.
    muted: Arc<AtomicBool>,
}

/// Resets a guard flag even if the guarded operation panics.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SharedDocument {
    /// Create an empty document. Offsets are byte offsets so wire
    /// positions and CRDT indices agree.
    pub fn new() -> Self {
        let mut options = Options::default();
        options.offset_kind = OffsetKind::Bytes;
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text("content");
        Self {
            inner: Mutex::new(DocState {
                doc,
                text,
                bridge_sub: None,
            }),
            applying_remote: Arc::new(AtomicBool::new(false)),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `chunk` at byte position `pos` as a local edit.
    pub fn insert(&self, pos: u32, chunk: &str) -> Result<(), DocError> {
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        check_position(&state.text.get_string(&txn), pos)?;
        state.text.insert(&mut txn, pos, chunk);
        Ok(())
    }

    /// Delete `len` bytes at byte position `pos` as a local edit.
    pub fn delete(&self, pos: u32, len: u32) -> Result<(), DocError> {
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        check_range(&state.text.get_string(&txn), pos, pos.saturating_add(len))?;
        state.text.remove_range(&mut txn, pos, len);
        Ok(())
    }

    /// Apply formatting over `[start, end)` as a local edit.
    pub fn format(&self, tag: u8, start: u32, end: u32, value: &[u8]) -> Result<(), DocError> {
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        check_range(&state.text.get_string(&txn), start, end)?;
        let attrs = format_attrs(tag, value)?;
        state.text.format(&mut txn, start, end - start, attrs);
        Ok(())
    }

    /// Apply a typed operation received from a transport.
    pub fn apply_remote_op(&self, op: &Op) -> Result<(), DocError> {
        if let Op::Raw(update) = op {
            return self.apply_remote_update(update).map(|_| ());
        }
        let _remote = FlagGuard::set(&self.applying_remote);
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        match op {
            Op::Raw(_) => unreachable!("handled above"),
            Op::Insert { pos, text } => {
                check_position(&state.text.get_string(&txn), *pos)?;
                state.text.insert(&mut txn, *pos, text);
            }
            Op::Delete { pos, len } => {
                check_range(
                    &state.text.get_string(&txn),
                    *pos,
                    pos.saturating_add(*len as u32),
                )?;
                state.text.remove_range(&mut txn, *pos, *len as u32);
            }
            Op::Batch { start, segments } => {
                let mut pos = *start;
                for seg in segments {
                    check_position(&state.text.get_string(&txn), pos)?;
                    state.text.insert(&mut txn, pos, seg);
                    pos += seg.len() as u32;
                }
            }
            Op::Format {
                tag,
                start,
                end,
                value,
            } => {
                check_range(&state.text.get_string(&txn), *start, *end)?;
                let attrs = format_attrs(*tag, value)?;
                state.text.format(&mut txn, *start, *end - *start, attrs);
            }
            Op::Structure(payload) => {
                log::debug!("structure op carried {} bytes; reserved, ignored", payload.len());
            }
        }
        Ok(())
    }

    /// Merge an opaque update received from a transport. Returns whether
    /// the document state changed (duplicates merge to no change).
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<bool, DocError> {
        let _remote = FlagGuard::set(&self.applying_remote);
        self.merge_update(update)
    }

    /// Merge an update produced locally (outside the typed edit API).
    /// The bridge does not forward it; the caller is responsible for
    /// sending it out.
    pub fn apply_local_update(&self, update: &[u8]) -> Result<bool, DocError> {
        let _muted = FlagGuard::set(&self.muted);
        self.merge_update(update)
    }

    fn merge_update(&self, update: &[u8]) -> Result<bool, DocError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocError::BadUpdate(e.to_string()))?;
        let state = self.lock();
        let mut txn = state.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(decoded)
            .map_err(|e| DocError::BadUpdate(e.to_string()))?;
        let after = txn.state_vector();
        Ok(before != after)
    }

    /// Run `f` with bridge forwarding suppressed. Used for edits that the
    /// session already routes through the typed op path.
    pub fn with_forwarding_muted<R>(&self, f: impl FnOnce() -> R) -> R {
        let _muted = FlagGuard::set(&self.muted);
        f()
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let state = self.lock();
        let txn = state.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Updates this replica has that a peer with state vector `sv` lacks.
    pub fn diff(&self, sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let remote = StateVector::decode_v1(sv).map_err(|e| DocError::BadUpdate(e.to_string()))?;
        let state = self.lock();
        let txn = state.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// The full document state as one update.
    pub fn full_state(&self) -> Vec<u8> {
        let state = self.lock();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current text contents.
    pub fn contents(&self) -> String {
        let state = self.lock();
        let txn = state.doc.transact();
        state.text.get_string(&txn)
    }

    /// Document length in bytes.
    pub fn len_bytes(&self) -> u32 {
        let state = self.lock();
        let txn = state.doc.transact();
        state.text.len(&txn)
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn check_position(s: &str, pos: u32) -> Result<(), DocError> {
    let pos = pos as usize;
    if pos > s.len() {
        return Err(DocError::OutOfRange {
            pos: pos as u32,
            len: s.len() as u32,
        });
    }
    if !s.is_char_boundary(pos) {
        return Err(DocError::NotCharBoundary(pos as u32));
    }
    Ok(())
}

fn check_range(s: &str, start: u32, end: u32) -> Result<(), DocError> {
    if end < start {
        return Err(DocError::OutOfRange {
            pos: end,
            len: s.len() as u32,
        });
    }
    check_position(s, start)?;
    check_position(s, end)
}

fn format_attrs(tag: u8, value: &[u8]) -> Result<Attrs, DocError> {
    let name: Arc<str> = match tag {
        0x01 => "bold".into(),
        0x02 => "italic".into(),
        0x03 => "underline".into(),
        0x04 => "strike".into(),
        0x05 => "color".into(),
        other => format!("format-{other}").into(),
    };
    let any = if value.is_empty() {
        Any::Bool(true)
    } else {
        let text = std::str::from_utf8(value).map_err(|_| DocError::BadFormatValue)?;
        Any::from(text.to_string())
    };
    Ok(HashMap::from([(name, any)]))
}

/// Receives every local update the transport should propagate.
pub struct UpdateBridge {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateBridge {
    /// Attach to a document's update events. Only one bridge per
    /// document.
    pub fn attach(doc: &SharedDocument) -> Result<UpdateBridge, DocError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let applying_remote = doc.applying_remote.clone();
        let muted = doc.muted.clone();
        let mut state = doc.lock();
        if state.bridge_sub.is_some() {
            return Err(DocError::BridgeAttached);
        }
        let sub = state
            .doc
            .observe_update_v1(move |_txn, event| {
                if applying_remote.load(Ordering::SeqCst) || muted.load(Ordering::SeqCst) {
                    return;
                }
                // Receiver dropped means the session is shutting down.
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| DocError::Subscribe(e.to_string()))?;
        state.bridge_sub = Some(sub);
        Ok(UpdateBridge { rx })
    }

    /// Next outbound update, or `None` once the document is gone.
    pub async fn next_update(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by tests.
    pub fn try_next_update(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}
