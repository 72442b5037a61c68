//! Relay message envelope.
//!
//! The relay transport carries everything on a single path; a one-byte
//! message type distinguishes document sync traffic from awareness
//! traffic. Sync payloads use the classic three-step shape: a state
//! vector announces what a replica has, a diff answers with what the
//! other side is missing, and updates carry incremental changes.

use crate::bytes::ByteReader;
use crate::frame::CodecError;

const MSG_SYNC: u8 = 0;
const MSG_AWARENESS: u8 = 1;

const SYNC_STATE_VECTOR: u8 = 0;
const SYNC_DIFF: u8 = 1;
const SYNC_UPDATE: u8 = 2;

/// Document synchronization payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// "Here is what I have" — the receiver answers with a diff.
    StateVector(Vec<u8>),
    /// Updates the requester was missing.
    Diff(Vec<u8>),
    /// An incremental update.
    Update(Vec<u8>),
}

/// A relay message: sync traffic or an awareness delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Sync(SyncMessage),
    /// Encoded awareness delta; opaque at this layer.
    Awareness(Vec<u8>),
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        match self {
            Envelope::Sync(msg) => {
                out.push(MSG_SYNC);
                let (subtype, payload) = match msg {
                    SyncMessage::StateVector(b) => (SYNC_STATE_VECTOR, b),
                    SyncMessage::Diff(b) => (SYNC_DIFF, b),
                    SyncMessage::Update(b) => (SYNC_UPDATE, b),
                };
                out.push(subtype);
                out.extend_from_slice(payload);
            }
            Envelope::Awareness(payload) => {
                out.push(MSG_AWARENESS);
                out.extend_from_slice(payload);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
        let mut r = ByteReader::new(bytes);
        match r.read_u8()? {
            MSG_SYNC => {
                let subtype = r.read_u8()?;
                let payload = r.read_rest().to_vec();
                let msg = match subtype {
                    SYNC_STATE_VECTOR => SyncMessage::StateVector(payload),
                    SYNC_DIFF => SyncMessage::Diff(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(CodecError::UnknownEnvelope(other)),
                };
                Ok(Envelope::Sync(msg))
            }
            MSG_AWARENESS => Ok(Envelope::Awareness(r.read_rest().to_vec())),
            other => Err(CodecError::UnknownEnvelope(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_variants_roundtrip() {
        for msg in [
            SyncMessage::StateVector(vec![1, 2]),
            SyncMessage::Diff(vec![3, 4, 5]),
            SyncMessage::Update(vec![]),
        ] {
            let env = Envelope::Sync(msg);
            assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
        }
    }

    #[test]
    fn awareness_roundtrip() {
        let env = Envelope::Awareness(vec![42; 15]);
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn type_tags_match_wire_contract() {
        let sync = Envelope::Sync(SyncMessage::Update(vec![]));
        assert_eq!(sync.encode()[0], 0);
        let awareness = Envelope::Awareness(vec![]);
        assert_eq!(awareness.encode()[0], 1);
    }

    #[test]
    fn unknown_tags_rejected() {
        assert_eq!(Envelope::decode(&[9]), Err(CodecError::UnknownEnvelope(9)));
        assert_eq!(
            Envelope::decode(&[0, 7, 1, 2]),
            Err(CodecError::UnknownEnvelope(7))
        );
        assert_eq!(Envelope::decode(&[]), Err(CodecError::Truncated));
    }
}
