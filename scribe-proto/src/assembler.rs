//! Incremental per-channel frame reassembly.
//!
//! One assembler per logical channel. Bytes arrive in arbitrary chunks;
//! the assembler buffers them and yields complete frame bodies as soon as
//! the 2-byte length header and the declared body length are available.
//! The state machine is an accumulated buffer plus an expected-length
//! cursor — iterative, never recursive.

/// Reassembles length-prefixed frames from an arbitrarily chunked byte
/// stream.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    /// Read offset into `buf`; consumed bytes are compacted lazily.
    consumed: usize,
    /// Body length parsed from the current frame header, if any.
    expected: Option<usize>,
}

/// Compact the internal buffer once this many bytes have been consumed.
const COMPACT_THRESHOLD: usize = 8 * 1024;

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame body, if enough bytes are buffered.
    ///
    /// Call in a loop: a single read may have delivered several frames.
    pub fn next_body(&mut self) -> Option<Vec<u8>> {
        if self.expected.is_none() {
            if self.available() < 2 {
                return None;
            }
            let hi = self.buf[self.consumed];
            let lo = self.buf[self.consumed + 1];
            self.consumed += 2;
            self.expected = Some(u16::from_be_bytes([hi, lo]) as usize);
        }

        let want = self.expected?;
        if self.available() < want {
            return None;
        }
        let body = self.buf[self.consumed..self.consumed + want].to_vec();
        self.consumed += want;
        self.expected = None;
        self.maybe_compact();
        Some(body)
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.available()
    }

    fn available(&self) -> usize {
        self.buf.len() - self.consumed
    }

    fn maybe_compact(&mut self) {
        if self.consumed >= COMPACT_THRESHOLD {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Op;

    fn frame_of(op: &Op) -> Vec<u8> {
        op.to_frame().unwrap()
    }

    #[test]
    fn single_frame_in_one_push() {
        let mut asm = FrameAssembler::new();
        let op = Op::Insert {
            pos: 3,
            text: "hey".into(),
        };
        asm.push(&frame_of(&op));
        let body = asm.next_body().unwrap();
        assert_eq!(Op::decode(&body).unwrap(), op);
        assert!(asm.next_body().is_none());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn body_split_across_reads() {
        // A frame declaring a 300-byte body, delivered as 100 then 200
        // bytes, must decode as exactly one message.
        let body = {
            let mut b = vec![0x00]; // RAW opcode
            b.extend(std::iter::repeat(0xab).take(299));
            b
        };
        assert_eq!(body.len(), 300);
        let mut frame = (300u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);

        let mut asm = FrameAssembler::new();
        asm.push(&frame[..102]); // header + 100 body bytes
        assert!(asm.next_body().is_none());
        asm.push(&frame[102..]); // remaining 200 body bytes
        let got = asm.next_body().unwrap();
        assert_eq!(got, body);
        assert!(asm.next_body().is_none());
    }

    #[test]
    fn header_split_across_reads() {
        let op = Op::Delete { pos: 1, len: 2 };
        let frame = frame_of(&op);
        let mut asm = FrameAssembler::new();
        asm.push(&frame[..1]);
        assert!(asm.next_body().is_none());
        asm.push(&frame[1..]);
        assert_eq!(Op::decode(&asm.next_body().unwrap()).unwrap(), op);
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let ops = [
            Op::Insert {
                pos: 0,
                text: "a".into(),
            },
            Op::Delete { pos: 0, len: 1 },
            Op::Raw(vec![1, 2, 3]),
        ];
        let mut wire = Vec::new();
        for op in &ops {
            wire.extend(frame_of(op));
        }
        let mut asm = FrameAssembler::new();
        asm.push(&wire);
        for op in &ops {
            let body = asm.next_body().expect("frame should be complete");
            assert_eq!(&Op::decode(&body).unwrap(), op);
        }
        assert!(asm.next_body().is_none());
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let op = Op::Batch {
            start: 5,
            segments: vec!["ab".into(), "cd".into()],
        };
        let frame = frame_of(&op);
        let mut asm = FrameAssembler::new();
        let mut decoded = None;
        for b in &frame {
            asm.push(std::slice::from_ref(b));
            if let Some(body) = asm.next_body() {
                decoded = Some(Op::decode(&body).unwrap());
            }
        }
        assert_eq!(decoded, Some(op));
    }

    #[test]
    fn bad_frame_leaves_following_frames_intact() {
        // A body with an unknown opcode is still a well-framed message:
        // the decoder rejects it, but the next frame parses cleanly.
        let bogus_body = [0x7f, 0xde, 0xad];
        let mut wire = (bogus_body.len() as u16).to_be_bytes().to_vec();
        wire.extend_from_slice(&bogus_body);
        let good = Op::Insert {
            pos: 9,
            text: "ok".into(),
        };
        wire.extend(frame_of(&good));

        let mut asm = FrameAssembler::new();
        asm.push(&wire);
        let first = asm.next_body().unwrap();
        assert!(Op::decode(&first).is_err());
        let second = asm.next_body().unwrap();
        assert_eq!(Op::decode(&second).unwrap(), good);
    }

    #[test]
    fn zero_length_body() {
        let mut asm = FrameAssembler::new();
        asm.push(&[0x00, 0x00]);
        assert_eq!(asm.next_body().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn compaction_keeps_stream_intact() {
        let op = Op::Raw(vec![7u8; 1024]);
        let frame = frame_of(&op);
        let mut asm = FrameAssembler::new();
        for _ in 0..64 {
            asm.push(&frame);
            let body = asm.next_body().unwrap();
            assert_eq!(Op::decode(&body).unwrap(), op);
        }
        assert_eq!(asm.pending(), 0);
    }
}
