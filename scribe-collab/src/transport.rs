//! Transport strategy interface.
//!
//! Exactly two strategies exist: channel multiplexing
//! ([`crate::channels::ChannelTransport`]) and the relay WebSocket
//! ([`crate::client::RelayTransport`]). Both speak the same logical
//! contract — send update bytes, receive update bytes — so the update
//! bridge and the consumer never know which one is active.

use std::fmt;

use tokio::sync::watch;

use scribe_proto::{CursorState, Op};

use crate::awareness::AwarenessEntry;

/// Connection lifecycle, surfaced on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Reliable channels are being opened and tagged.
    StreamsInitializing,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::StreamsInitializing => write!(f, "streams-initializing"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Which strategy a session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Channels,
    Relay,
}

/// Inbound traffic, unified across strategies.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An opaque CRDT update to merge.
    Update(Vec<u8>),
    /// A typed positional operation (channel strategy only).
    Edit(Op),
    /// A peer announced its state vector and wants our diff.
    StateVector(Vec<u8>),
    /// Presence records for one or more clients.
    Awareness(Vec<AwarenessEntry>),
    /// The connection is gone; read loops have stopped.
    Closed,
}

/// Transport failures.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Establishing the connection failed; the caller may fall back.
    ConnectFailed(String),
    /// The connection's writers are gone.
    ChannelClosed,
    /// Payload cannot fit the wire format.
    Oversize(usize),
    /// Frame encoding failed.
    Encode(String),
    /// The active strategy has no typed op path.
    EditsUnsupported,
}

impl From<scribe_proto::CodecError> for TransportError {
    fn from(e: scribe_proto::CodecError) -> Self {
        match e {
            scribe_proto::CodecError::Oversize(len) => TransportError::Oversize(len),
            other => TransportError::Encode(other.to_string()),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectFailed(e) => write!(f, "connection failed: {e}"),
            TransportError::ChannelClosed => write!(f, "connection closed"),
            TransportError::Oversize(len) => {
                write!(f, "payload of {len} bytes exceeds the frame limit")
            }
            TransportError::Encode(e) => write!(f, "frame encoding failed: {e}"),
            TransportError::EditsUnsupported => {
                write!(f, "active transport has no typed edit path")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// A connected transport strategy. Sends are fire-and-forget: they enqueue
/// onto writer tasks and never block the caller.
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Send an opaque CRDT update.
    fn send_update(&self, update: &[u8]) -> Result<(), TransportError>;

    /// Whether typed positional ops have a wire path here.
    fn edits_supported(&self) -> bool {
        false
    }

    /// Send a typed operation. Only called when [`Transport::edits_supported`]
    /// returns true.
    fn send_edit(&self, _op: &Op) -> Result<(), TransportError> {
        Err(TransportError::EditsUnsupported)
    }

    /// Announce our state vector to request missing updates. A no-op on
    /// strategies without a catch-up exchange.
    fn send_state_vector(&self, _sv: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    /// Answer a peer's state vector with the updates it lacks.
    fn send_diff(&self, _diff: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    /// Broadcast our cursor state, best-effort.
    fn send_awareness(&self, client_id: u16, state: CursorState) -> Result<(), TransportError>;

    /// Connection status stream.
    fn status(&self) -> watch::Receiver<ConnectionState>;

    /// Stop read loops and release writers. Idempotent, never panics.
    fn close(&self);
}
