//! # scribe-collab — Real-time collaborative editing synchronization
//!
//! Keeps one shared rich-text document converged across any number of
//! clients, independent of message ordering, duplication, or transient
//! disconnects.
//!
//! ## Architecture
//!
//! ```text
//! local edit ──► SharedDocument ──► UpdateBridge ──► DeltaCompressor
//!                    ▲ (CRDT)            │            (text ops only)
//!                    │                   │                  │
//!                merge ◄── Transport ◄── codec ◄────────────┘
//!                            │
//!              ┌─────────────┴──────────────┐
//!              │                            │
//!      ChannelTransport              RelayTransport
//!      3 tagged streams + UDP        single WebSocket
//!              │                            │
//!       ChannelServer                 RelayServer
//!       (verbatim frame relay)        (authoritative per-room doc)
//! ```
//!
//! Two interchangeable transport strategies sit behind one [`Transport`]
//! trait; the bridge and the consumer never branch on which is active.
//! Echo loops are prevented by a single origin filter in the bridge:
//! never re-send what was just received from the network.
//!
//! ## Modules
//!
//! - [`document`] — shared CRDT document + update bridge
//! - [`compress`] — 50 ms insert batching ahead of the codec
//! - [`transport`] — strategy trait and connection lifecycle
//! - [`channels`] — channel-multiplexed transport and its relay server
//! - [`client`] — consumer-facing session and the relay transport
//! - [`server`] — relay WebSocket server
//! - [`awareness`] — ephemeral cursor presence registry
//! - [`broadcast`] — per-room fan-out with backpressure

pub mod awareness;
pub mod broadcast;
pub mod channels;
pub mod client;
pub mod compress;
pub mod document;
pub mod server;
pub mod transport;

pub use awareness::{AwarenessEntry, AwarenessRegistry};
pub use broadcast::{BroadcastGroup, Member, RoomMessage};
pub use channels::{ChannelConfig, ChannelServer, ChannelServerConfig, ChannelTransport};
pub use client::{CollabSession, RelayTransport, SessionConfig, SessionError, SessionEvent};
pub use compress::{DeltaCompressor, BATCH_WINDOW};
pub use document::{DocError, SharedDocument, UpdateBridge};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportKind,
};
