//! # scribe-proto — Binary wire protocol for collaborative editing
//!
//! Pure encoding/decoding for the scribe synchronization layer. No I/O,
//! no async: everything here operates on byte slices and buffers.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────┐
//! │ length (u16) │ body: opcode (u8) + typed payload   │
//! │ big-endian   │ ≤ 65535 bytes                       │
//! └──────────────┴─────────────────────────────────────┘
//! ```
//!
//! A logical channel is a reliable byte stream whose first byte is a
//! channel tag ([`Channel`]); length-prefixed frames follow. Frames may be
//! split arbitrarily across reads — [`FrameAssembler`] reassembles them
//! incrementally per channel.
//!
//! ## Modules
//!
//! - [`frame`] — operation codec (`Op`: RAW / INSERT / DELETE / BATCH /
//!   FORMAT / STRUCTURE)
//! - [`assembler`] — per-channel incremental frame reassembly
//! - [`channel`] — logical channel tags
//! - [`envelope`] — relay message envelope (sync / awareness)
//! - [`awareness`] — fixed-width cursor presence datagram

pub mod assembler;
pub mod awareness;
mod bytes;
pub mod channel;
pub mod envelope;
pub mod frame;

pub use assembler::FrameAssembler;
pub use awareness::{AwarenessDatagram, CursorState, DATAGRAM_LEN};
pub use channel::Channel;
pub use envelope::{Envelope, SyncMessage};
pub use frame::{CodecError, Op, MAX_BODY_LEN};
