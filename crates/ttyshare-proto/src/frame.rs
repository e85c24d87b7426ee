//! Binary frames sent by viewers
//!
//! The first byte selects the frame kind:
//! - `0x00` resize: rows (u16 BE), cols (u16 BE)
//! - `0x01` upload: name length (u16 BE), name, content
//! - `0x02` chunk: index, total, payload
//! - anything else is raw keyboard input
//!
//! Single-byte frames are always input. Ctrl-@, Ctrl-A and Ctrl-B arrive as
//! lone `0x00`/`0x01`/`0x02` bytes and must reach the process.

use crate::chunk::{ChunkFrame, CHUNK_FRAME_TYPE};
use crate::error::{ProtocolError, Result};
use crate::TermSize;
use bytes::{BufMut, Bytes, BytesMut};

pub const RESIZE_FRAME_TYPE: u8 = 0x00;
pub const UPLOAD_FRAME_TYPE: u8 = 0x01;

const RESIZE_FRAME_LEN: usize = 5;
const UPLOAD_HEADER_LEN: usize = 3;

/// A decoded viewer binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Resize(TermSize),
    Upload { filename: String, content: Bytes },
    Chunk(ChunkFrame),
    Input(Bytes),
}

impl InboundFrame {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() <= 1 {
            return Ok(InboundFrame::Input(data));
        }

        match data[0] {
            RESIZE_FRAME_TYPE if data.len() == RESIZE_FRAME_LEN => {
                let rows = u16::from_be_bytes([data[1], data[2]]);
                let cols = u16::from_be_bytes([data[3], data[4]]);
                Ok(InboundFrame::Resize(TermSize { rows, cols }))
            }
            UPLOAD_FRAME_TYPE => parse_upload(data),
            CHUNK_FRAME_TYPE => Ok(InboundFrame::Chunk(ChunkFrame::decode(&data)?)),
            _ => Ok(InboundFrame::Input(data)),
        }
    }
}

fn parse_upload(data: Bytes) -> Result<InboundFrame> {
    if data.len() < UPLOAD_HEADER_LEN {
        return Err(ProtocolError::MalformedUpload(format!(
            "header needs {} bytes, got {}",
            UPLOAD_HEADER_LEN,
            data.len()
        )));
    }

    let name_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    let name_end = UPLOAD_HEADER_LEN + name_len;
    if data.len() < name_end {
        return Err(ProtocolError::MalformedUpload(format!(
            "filename length {} exceeds frame ({} bytes)",
            name_len,
            data.len()
        )));
    }

    let filename = std::str::from_utf8(&data[UPLOAD_HEADER_LEN..name_end])
        .map_err(|e| ProtocolError::MalformedUpload(format!("filename is not UTF-8: {}", e)))?
        .to_string();

    Ok(InboundFrame::Upload {
        filename,
        content: data.slice(name_end..),
    })
}

/// Encode a resize frame
pub fn encode_resize(size: TermSize) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESIZE_FRAME_LEN);
    buf.put_u8(RESIZE_FRAME_TYPE);
    buf.put_u16(size.rows);
    buf.put_u16(size.cols);
    buf.freeze()
}

/// Encode an upload frame
pub fn encode_upload(filename: &str, content: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(UPLOAD_HEADER_LEN + filename.len() + content.len());
    buf.put_u8(UPLOAD_FRAME_TYPE);
    buf.put_u16(filename.len() as u16);
    buf.extend_from_slice(filename.as_bytes());
    buf.extend_from_slice(content);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resize() {
        let frame = InboundFrame::parse(encode_resize(TermSize::new(40, 100))).unwrap();
        assert_eq!(frame, InboundFrame::Resize(TermSize::new(40, 100)));
    }

    #[test]
    fn test_parse_upload() {
        let frame = InboundFrame::parse(encode_upload("notes.txt", b"hi there")).unwrap();
        match frame {
            InboundFrame::Upload { filename, content } => {
                assert_eq!(filename, "notes.txt");
                assert_eq!(&content[..], b"hi there");
            }
            other => panic!("expected upload, got {:?}", other),
        }
    }

    #[test]
    fn test_upload_with_truncated_name_is_error() {
        let data = Bytes::from_static(&[UPLOAD_FRAME_TYPE, 0x00, 0x10, b'a', b'b']);
        assert!(matches!(
            InboundFrame::parse(data),
            Err(ProtocolError::MalformedUpload(_))
        ));
    }

    #[test]
    fn test_upload_header_too_short_is_error() {
        let data = Bytes::from_static(&[UPLOAD_FRAME_TYPE, 0x00]);
        assert!(InboundFrame::parse(data).is_err());
    }

    #[test]
    fn test_single_control_bytes_are_input() {
        for byte in [0x00u8, 0x01, 0x02] {
            let frame = InboundFrame::parse(Bytes::copy_from_slice(&[byte])).unwrap();
            assert_eq!(frame, InboundFrame::Input(Bytes::copy_from_slice(&[byte])));
        }
    }

    #[test]
    fn test_nul_prefixed_non_resize_is_input() {
        let data = Bytes::from_static(&[0x00, 0x01, 0x02]);
        assert!(matches!(
            InboundFrame::parse(data).unwrap(),
            InboundFrame::Input(_)
        ));
    }

    #[test]
    fn test_plain_text_is_input() {
        let frame = InboundFrame::parse(Bytes::from_static(b"ls -la\r")).unwrap();
        assert_eq!(frame, InboundFrame::Input(Bytes::from_static(b"ls -la\r")));
    }

    #[test]
    fn test_chunk_frame_is_decoded() {
        let data = Bytes::from_static(&[CHUNK_FRAME_TYPE, 0, 1, b'z']);
        match InboundFrame::parse(data).unwrap() {
            InboundFrame::Chunk(frame) => {
                assert_eq!(frame.total, 1);
                assert_eq!(&frame.payload[..], b"z");
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }
}
