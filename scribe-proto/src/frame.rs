//! Operation codec: typed operations ↔ length-prefixed binary frames.
//!
//! Body layout per opcode:
//!
//! | Code | Operation | Payload |
//! |------|-----------|---------|
//! | 0x00 | RAW       | opaque CRDT update bytes |
//! | 0x01 | INSERT    | u32 position, u16 byte-length, UTF-8 bytes |
//! | 0x02 | DELETE    | u32 position, u16 length |
//! | 0x03 | BATCH     | u32 start, u8 count, count × (u16 length, UTF-8 bytes) |
//! | 0x10 | FORMAT    | u8 tag, u32 start, u32 end, value bytes |
//! | 0x20 | STRUCTURE | reserved; payload carried opaquely |
//!
//! All integers are big-endian. A frame is `u16 body-length + body`; the
//! body never exceeds [`MAX_BODY_LEN`].

use std::fmt;

use crate::bytes::ByteReader;

/// Maximum frame body size, bounded by the u16 length header.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Maximum number of segments a BATCH may carry.
pub const MAX_BATCH_OPS: usize = u8::MAX as usize;

pub(crate) mod opcode {
    pub const RAW: u8 = 0x00;
    pub const INSERT: u8 = 0x01;
    pub const DELETE: u8 = 0x02;
    pub const BATCH: u8 = 0x03;
    pub const FORMAT: u8 = 0x10;
    pub const STRUCTURE: u8 = 0x20;
}

/// A decoded wire operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Opaque CRDT update, applied verbatim by the receiver.
    Raw(Vec<u8>),
    /// Insert `text` at byte position `pos`.
    Insert { pos: u32, text: String },
    /// Delete `len` bytes starting at byte position `pos`.
    Delete { pos: u32, len: u16 },
    /// Contiguous inserts starting at `start`; segments are kept separate
    /// so receivers can reconstruct the original operation sequence.
    Batch { start: u32, segments: Vec<String> },
    /// Apply formatting `tag` with `value` over `[start, end)`.
    Format {
        tag: u8,
        start: u32,
        end: u32,
        value: Vec<u8>,
    },
    /// Reserved structure operation; payload preserved opaquely.
    Structure(Vec<u8>),
}

impl Op {
    /// The operation code this op encodes as.
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Raw(_) => opcode::RAW,
            Op::Insert { .. } => opcode::INSERT,
            Op::Delete { .. } => opcode::DELETE,
            Op::Batch { .. } => opcode::BATCH,
            Op::Format { .. } => opcode::FORMAT,
            Op::Structure(_) => opcode::STRUCTURE,
        }
    }

    /// Encode the frame body (opcode + payload), without the length header.
    pub fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(16);
        body.push(self.opcode());
        match self {
            Op::Raw(update) => body.extend_from_slice(update),
            Op::Insert { pos, text } => {
                let len = u16::try_from(text.len())
                    .map_err(|_| CodecError::Oversize(text.len()))?;
                body.extend_from_slice(&pos.to_be_bytes());
                body.extend_from_slice(&len.to_be_bytes());
                body.extend_from_slice(text.as_bytes());
            }
            Op::Delete { pos, len } => {
                body.extend_from_slice(&pos.to_be_bytes());
                body.extend_from_slice(&len.to_be_bytes());
            }
            Op::Batch { start, segments } => {
                if segments.is_empty() || segments.len() > MAX_BATCH_OPS {
                    return Err(CodecError::BadBatch(segments.len()));
                }
                body.extend_from_slice(&start.to_be_bytes());
                body.push(segments.len() as u8);
                for seg in segments {
                    let len = u16::try_from(seg.len())
                        .map_err(|_| CodecError::Oversize(seg.len()))?;
                    body.extend_from_slice(&len.to_be_bytes());
                    body.extend_from_slice(seg.as_bytes());
                }
            }
            Op::Format {
                tag,
                start,
                end,
                value,
            } => {
                body.push(*tag);
                body.extend_from_slice(&start.to_be_bytes());
                body.extend_from_slice(&end.to_be_bytes());
                body.extend_from_slice(value);
            }
            Op::Structure(payload) => body.extend_from_slice(payload),
        }
        if body.len() > MAX_BODY_LEN {
            return Err(CodecError::Oversize(body.len()));
        }
        Ok(body)
    }

    /// Encode a complete frame: u16 big-endian body length, then the body.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        let body = self.encode_body()?;
        let mut frame = Vec::with_capacity(2 + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one frame body. The caller strips the length header (see
    /// [`crate::FrameAssembler`]).
    pub fn decode(body: &[u8]) -> Result<Op, CodecError> {
        let mut r = ByteReader::new(body);
        let code = r.read_u8()?;
        match code {
            opcode::RAW => Ok(Op::Raw(r.read_rest().to_vec())),
            opcode::INSERT => {
                let pos = r.read_u32()?;
                let len = r.read_u16()? as usize;
                let text = read_utf8(&mut r, len)?;
                Ok(Op::Insert { pos, text })
            }
            opcode::DELETE => {
                let pos = r.read_u32()?;
                let len = r.read_u16()?;
                Ok(Op::Delete { pos, len })
            }
            opcode::BATCH => {
                let start = r.read_u32()?;
                let count = r.read_u8()? as usize;
                if count == 0 {
                    return Err(CodecError::BadBatch(0));
                }
                let mut segments = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = r.read_u16()? as usize;
                    segments.push(read_utf8(&mut r, len)?);
                }
                Ok(Op::Batch { start, segments })
            }
            opcode::FORMAT => {
                let tag = r.read_u8()?;
                let start = r.read_u32()?;
                let end = r.read_u32()?;
                Ok(Op::Format {
                    tag,
                    start,
                    end,
                    value: r.read_rest().to_vec(),
                })
            }
            opcode::STRUCTURE => Ok(Op::Structure(r.read_rest().to_vec())),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

fn read_utf8(r: &mut ByteReader<'_>, len: usize) -> Result<String, CodecError> {
    let bytes = r.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Codec failures. Decoders report these so callers can log and drop the
/// offending frame while keeping the channel's reassembly state intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Operation code not in the protocol table.
    UnknownOpcode(u8),
    /// Body ended before the declared payload.
    Truncated,
    /// Text payload was not valid UTF-8.
    InvalidUtf8,
    /// Encoded body would exceed the u16 length header.
    Oversize(usize),
    /// BATCH with zero segments or more than 255.
    BadBatch(usize),
    /// Awareness datagram of the wrong width or tag.
    BadDatagram,
    /// Relay envelope with an unknown message type.
    UnknownEnvelope(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownOpcode(code) => write!(f, "unknown opcode 0x{code:02x}"),
            CodecError::Truncated => write!(f, "frame body truncated"),
            CodecError::InvalidUtf8 => write!(f, "text payload is not valid UTF-8"),
            CodecError::Oversize(len) => {
                write!(f, "body of {len} bytes exceeds the {MAX_BODY_LEN}-byte frame limit")
            }
            CodecError::BadBatch(count) => write!(f, "batch with invalid segment count {count}"),
            CodecError::BadDatagram => write!(f, "malformed awareness datagram"),
            CodecError::UnknownEnvelope(tag) => write!(f, "unknown envelope type {tag}"),
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_roundtrip() {
        let op = Op::Insert {
            pos: 42,
            text: "hello".to_string(),
        };
        let frame = op.to_frame().unwrap();
        // 2-byte header + opcode + u32 + u16 + 5 bytes of text
        assert_eq!(frame.len(), 2 + 1 + 4 + 2 + 5);
        assert_eq!(&frame[..2], &[0x00, 12]);
        let decoded = Op::decode(&frame[2..]).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn delete_roundtrip() {
        let op = Op::Delete { pos: 7, len: 300 };
        let body = op.encode_body().unwrap();
        assert_eq!(body.len(), 1 + 4 + 2);
        assert_eq!(Op::decode(&body).unwrap(), op);
    }

    #[test]
    fn batch_preserves_segments() {
        let op = Op::Batch {
            start: 0,
            segments: vec!["a".into(), "b".into(), "c".into()],
        };
        let body = op.encode_body().unwrap();
        match Op::decode(&body).unwrap() {
            Op::Batch { start, segments } => {
                assert_eq!(start, 0);
                assert_eq!(segments, vec!["a", "b", "c"]);
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn batch_rejects_empty_and_oversized() {
        let empty = Op::Batch {
            start: 0,
            segments: vec![],
        };
        assert_eq!(empty.encode_body(), Err(CodecError::BadBatch(0)));

        let too_many = Op::Batch {
            start: 0,
            segments: vec!["x".to_string(); 256],
        };
        assert_eq!(too_many.encode_body(), Err(CodecError::BadBatch(256)));
    }

    #[test]
    fn format_roundtrip() {
        let op = Op::Format {
            tag: 2,
            start: 10,
            end: 25,
            value: b"#ff0000".to_vec(),
        };
        let body = op.encode_body().unwrap();
        assert_eq!(Op::decode(&body).unwrap(), op);
    }

    #[test]
    fn raw_and_structure_are_opaque() {
        let raw = Op::Raw(vec![9, 8, 7]);
        assert_eq!(Op::decode(&raw.encode_body().unwrap()).unwrap(), raw);

        let structure = Op::Structure(vec![1, 2, 3, 4]);
        let body = structure.encode_body().unwrap();
        assert_eq!(body[0], 0x20);
        assert_eq!(Op::decode(&body).unwrap(), structure);
    }

    #[test]
    fn unknown_opcode_reports_code() {
        assert_eq!(
            Op::decode(&[0x7f, 1, 2, 3]),
            Err(CodecError::UnknownOpcode(0x7f))
        );
    }

    #[test]
    fn truncated_insert_errors() {
        let op = Op::Insert {
            pos: 0,
            text: "hello".to_string(),
        };
        let body = op.encode_body().unwrap();
        assert_eq!(Op::decode(&body[..body.len() - 2]), Err(CodecError::Truncated));
    }

    #[test]
    fn invalid_utf8_rejected() {
        // INSERT declaring 2 bytes of text that are not UTF-8.
        let body = [0x01, 0, 0, 0, 0, 0, 2, 0xff, 0xfe];
        assert_eq!(Op::decode(&body), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn oversize_insert_rejected() {
        let op = Op::Insert {
            pos: 0,
            text: "x".repeat(MAX_BODY_LEN),
        };
        assert!(matches!(op.encode_body(), Err(CodecError::Oversize(_))));
    }

    #[test]
    fn empty_raw_update_is_valid() {
        let op = Op::Raw(Vec::new());
        let frame = op.to_frame().unwrap();
        assert_eq!(frame, vec![0x00, 0x01, 0x00]);
        assert_eq!(Op::decode(&frame[2..]).unwrap(), op);
    }
}
