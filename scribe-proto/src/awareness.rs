//! Cursor presence datagram.
//!
//! Awareness state travels on an unreliable, unordered path, so each
//! datagram is a complete fixed-width record: latest value wins, lost
//! datagrams are never retried.
//!
//! Layout: `u8 op (0x00), u16 client id, u32 cursor, u32 anchor, u32 head`,
//! big-endian throughout.

use crate::bytes::ByteReader;
use crate::frame::CodecError;

/// Datagram operation tag. A single operation exists today; the byte
/// keeps room for future presence record kinds.
pub const AWARENESS_OP: u8 = 0x00;

/// Fixed width of an awareness datagram.
pub const DATAGRAM_LEN: usize = 15;

/// A client's cursor and selection, in document byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorState {
    pub cursor: u32,
    /// Selection anchor (where the selection started).
    pub anchor: u32,
    /// Selection head (the moving end).
    pub head: u32,
}

/// One presence record as sent on the datagram path.
///
/// The 16-bit client id is compact but can collide under very large
/// populations; room membership at editing scale keeps the risk
/// negligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessDatagram {
    pub client_id: u16,
    pub state: CursorState,
}

impl AwarenessDatagram {
    pub fn new(client_id: u16, cursor: u32, anchor: u32, head: u32) -> Self {
        Self {
            client_id,
            state: CursorState {
                cursor,
                anchor,
                head,
            },
        }
    }

    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut out = [0u8; DATAGRAM_LEN];
        out[0] = AWARENESS_OP;
        out[1..3].copy_from_slice(&self.client_id.to_be_bytes());
        out[3..7].copy_from_slice(&self.state.cursor.to_be_bytes());
        out[7..11].copy_from_slice(&self.state.anchor.to_be_bytes());
        out[11..15].copy_from_slice(&self.state.head.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != DATAGRAM_LEN {
            return Err(CodecError::BadDatagram);
        }
        let mut r = ByteReader::new(bytes);
        if r.read_u8()? != AWARENESS_OP {
            return Err(CodecError::BadDatagram);
        }
        let client_id = r.read_u16()?;
        let cursor = r.read_u32()?;
        let anchor = r.read_u32()?;
        let head = r.read_u32()?;
        Ok(Self {
            client_id,
            state: CursorState {
                cursor,
                anchor,
                head,
            },
        })
    }
}
