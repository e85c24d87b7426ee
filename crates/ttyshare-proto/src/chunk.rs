//! Chunked resync codec
//!
//! Mobile transports behind aggressive proxies silently drop large frames, so
//! resync payloads are split into bounded pieces. Index and total each fit in
//! one byte, which caps a sequence at 255 frames.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Type marker for chunk frames
pub const CHUNK_FRAME_TYPE: u8 = 0x02;

/// Protocol ceiling on frames per sequence
pub const MAX_CHUNKS: usize = 255;

/// Smallest payload size accepted by [`chunk`]
pub const MIN_CHUNK_SIZE: usize = 64;

/// Header length: type, index, total
pub const CHUNK_HEADER_LEN: usize = 3;

/// One piece of a chunked buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub index: u8,
    pub total: u8,
    pub payload: Bytes,
}

impl ChunkFrame {
    /// Encode as `[0x02, index, total, payload...]`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        buf.put_u8(CHUNK_FRAME_TYPE);
        buf.put_u8(self.index);
        buf.put_u8(self.total);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a full frame including the type marker
    pub fn decode(frame: &Bytes) -> Result<Self> {
        if frame.len() < CHUNK_HEADER_LEN {
            return Err(ProtocolError::MalformedChunk(format!(
                "frame too short ({} bytes)",
                frame.len()
            )));
        }
        if frame[0] != CHUNK_FRAME_TYPE {
            return Err(ProtocolError::MalformedChunk(format!(
                "unexpected type marker 0x{:02x}",
                frame[0]
            )));
        }

        let index = frame[1];
        let total = frame[2];
        if total == 0 || index >= total {
            return Err(ProtocolError::MalformedChunk(format!(
                "index {} out of range for total {}",
                index, total
            )));
        }

        Ok(Self {
            index,
            total,
            payload: frame.slice(CHUNK_HEADER_LEN..),
        })
    }
}

/// Split `data` into at most [`MAX_CHUNKS`] frames of at most `max_chunk_size`
/// payload bytes each, growing the piece size when the ceiling would be hit.
///
/// Always returns at least one frame.
pub fn chunk(data: &[u8], max_chunk_size: usize) -> Vec<ChunkFrame> {
    let mut piece = max_chunk_size.max(MIN_CHUNK_SIZE);
    if data.len().div_ceil(piece) > MAX_CHUNKS {
        piece = data.len().div_ceil(MAX_CHUNKS);
    }

    if data.is_empty() {
        return vec![ChunkFrame {
            index: 0,
            total: 1,
            payload: Bytes::new(),
        }];
    }

    let data = Bytes::copy_from_slice(data);
    let total = data.len().div_ceil(piece);

    (0..total)
        .map(|i| {
            let start = i * piece;
            let end = (start + piece).min(data.len());
            ChunkFrame {
                index: i as u8,
                total: total as u8,
                payload: data.slice(start..end),
            }
        })
        .collect()
}

/// Reassembles one chunk sequence at a time.
///
/// Frames must arrive in order starting at index 0. An index 0 frame always
/// starts a fresh sequence, discarding any partial one.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    total: u8,
    next: u8,
    buf: BytesMut,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a frame. Returns the reassembled buffer once the last frame lands.
    pub fn push(&mut self, frame: ChunkFrame) -> Result<Option<Bytes>> {
        if frame.index == 0 {
            self.total = frame.total;
            self.next = 0;
            self.buf.clear();
        } else if self.total == 0 {
            return Err(ProtocolError::ChunkOutOfSequence {
                expected: 0,
                got: frame.index,
            });
        }

        if frame.total != self.total {
            let expected = self.total;
            self.reset();
            return Err(ProtocolError::ChunkTotalMismatch {
                expected,
                got: frame.total,
            });
        }
        if frame.index != self.next {
            let expected = self.next;
            self.reset();
            return Err(ProtocolError::ChunkOutOfSequence {
                expected,
                got: frame.index,
            });
        }

        self.buf.extend_from_slice(&frame.payload);
        self.next += 1;

        if self.next == self.total {
            let done = self.buf.split().freeze();
            self.reset();
            return Ok(Some(done));
        }
        Ok(None)
    }

    /// Whether a sequence is partially received
    pub fn in_progress(&self) -> bool {
        self.total != 0
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.next = 0;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(frames: Vec<ChunkFrame>) -> Bytes {
        let mut assembler = ChunkAssembler::new();
        let mut out = None;
        for frame in frames {
            out = assembler.push(frame).unwrap();
        }
        out.expect("sequence should complete")
    }

    #[test]
    fn test_empty_input_yields_one_frame() {
        let frames = chunk(&[], 1024);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].total, 1);
        assert!(frames[0].payload.is_empty());
        assert!(assemble(frames).is_empty());
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
        for max in [64, 100, 1000, 4096, 9999, 10_000, 50_000] {
            let frames = chunk(&data, max);
            assert!(frames.len() <= MAX_CHUNKS);
            assert!(frames.iter().all(|f| f.payload.len() <= max.max(MIN_CHUNK_SIZE)));
            assert_eq!(assemble(frames), data.as_slice(), "max={}", max);
        }
    }

    #[test]
    fn test_piece_size_grows_to_respect_ceiling() {
        let data = vec![0xabu8; 1_000_000];
        let frames = chunk(&data, 64);
        assert!(frames.len() <= MAX_CHUNKS);
        assert_eq!(frames[0].total as usize, frames.len());
        assert_eq!(assemble(frames).len(), data.len());
    }

    #[test]
    fn test_small_max_is_clamped() {
        let data = vec![1u8; 200];
        let frames = chunk(&data, 1);
        assert_eq!(frames.len(), 200usize.div_ceil(MIN_CHUNK_SIZE));
    }

    #[test]
    fn test_encode_decode_frame() {
        let frame = ChunkFrame {
            index: 2,
            total: 5,
            payload: Bytes::from_static(b"hello"),
        };
        let wire = frame.encode();
        assert_eq!(&wire[..3], &[CHUNK_FRAME_TYPE, 2, 5]);
        assert_eq!(ChunkFrame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_bad_index() {
        let wire = Bytes::from_static(&[CHUNK_FRAME_TYPE, 3, 3, b'x']);
        assert!(ChunkFrame::decode(&wire).is_err());
        let wire = Bytes::from_static(&[CHUNK_FRAME_TYPE, 0, 0]);
        assert!(ChunkFrame::decode(&wire).is_err());
    }

    #[test]
    fn test_assembler_rejects_gap_and_recovers() {
        let data = vec![9u8; 300];
        let frames = chunk(&data, 100);
        assert_eq!(frames.len(), 3);

        let mut assembler = ChunkAssembler::new();
        assert!(assembler.push(frames[0].clone()).unwrap().is_none());
        assert!(assembler.push(frames[2].clone()).is_err());
        assert!(!assembler.in_progress());

        // A fresh sequence still assembles
        let mut out = None;
        for frame in frames {
            out = assembler.push(frame).unwrap();
        }
        assert_eq!(out.unwrap().len(), 300);
    }

    #[test]
    fn test_assembler_rejects_continuation_without_start() {
        let mut assembler = ChunkAssembler::new();
        let frame = ChunkFrame {
            index: 1,
            total: 2,
            payload: Bytes::from_static(b"x"),
        };
        assert!(assembler.push(frame).is_err());
    }
}
