//! Self-describing WAL frames.
//!
//! ```text
//! offset        size  field
//! 0             4     magic (FRAME_MAGIC)
//! 4             1     record kind
//! 5             4     payload length (n)
//! 9             4     crc32 of magic, kind and length
//! 13            n     payload
//! 13 + n        4     crc32 of kind, length and payload
//! 17 + n        4     end marker (FRAME_END)
//! ```
//!
//! All integers are little-endian. The header carries its own checksum, so a
//! damaged length is never mistaken for a frame running past the end of the
//! log. A frame whose verified extent runs past the end of the log is torn; a
//! frame that fails any other check is corrupt.

use crate::common::{FRAME_END, FRAME_MAGIC, MAX_RECORD_SIZE};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crc32fast::Hasher;

pub const FRAME_HEADER_SIZE: usize = 13;
pub const FRAME_TRAILER_SIZE: usize = 8;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + FRAME_TRAILER_SIZE
    }
}

/// Outcome of decoding bytes at one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecode {
    Complete(Frame),
    /// The log ends before the frame does.
    Torn,
    /// The frame is complete but malformed.
    Corrupt {
        reason: String,
        /// Declared size of the frame, when the header could be trusted.
        declared_len: Option<usize>,
    },
}

fn checksum(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn header_checksum(header: &[u8]) -> u32 {
    crc32fast::hash(&header[..9])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Encodes one frame.
pub fn encode_frame(kind: u8, payload: &[u8]) -> TwoPhaseResult<Vec<u8>> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(TwoPhaseError::new(
            &format!(
                "record of {} bytes exceeds the maximum of {} bytes",
                payload.len(),
                MAX_RECORD_SIZE
            ),
            ErrorKind::InvalidOperation,
        ));
    }

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let header_crc = header_checksum(&out);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(kind, payload).to_le_bytes());
    out.extend_from_slice(&FRAME_END.to_le_bytes());
    Ok(out)
}

/// Reads the payload length declared by a frame header.
///
/// Returns `None` if `header` is shorter than a frame header, its magic is
/// wrong or it fails its checksum.
pub fn declared_frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < FRAME_HEADER_SIZE
        || read_u32(header, 0) != FRAME_MAGIC
        || read_u32(header, 9) != header_checksum(header)
    {
        return None;
    }
    Some(FRAME_HEADER_SIZE + read_u32(header, 5) as usize + FRAME_TRAILER_SIZE)
}

/// Decodes the frame at the start of `bytes`.
///
/// `bytes` must contain everything from the frame start up to the end of the
/// log (or at least the whole declared frame).
pub fn decode_frame(bytes: &[u8]) -> FrameDecode {
    if bytes.len() < 4 {
        return FrameDecode::Torn;
    }
    if read_u32(bytes, 0) != FRAME_MAGIC {
        return FrameDecode::Corrupt {
            reason: "invalid frame magic".to_string(),
            declared_len: None,
        };
    }
    if bytes.len() < FRAME_HEADER_SIZE {
        return FrameDecode::Torn;
    }
    if read_u32(bytes, 9) != header_checksum(bytes) {
        return FrameDecode::Corrupt {
            reason: "incorrect frame header checksum".to_string(),
            declared_len: None,
        };
    }

    let kind = bytes[4];
    let payload_len = read_u32(bytes, 5) as usize;
    if payload_len > MAX_RECORD_SIZE {
        return FrameDecode::Corrupt {
            reason: format!("invalid frame length {}", payload_len),
            declared_len: None,
        };
    }

    let total = FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE;
    if bytes.len() < total {
        return FrameDecode::Torn;
    }

    let payload = &bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len];
    let crc_at = FRAME_HEADER_SIZE + payload_len;
    let stored_crc = read_u32(bytes, crc_at);
    if stored_crc != checksum(kind, payload) {
        return FrameDecode::Corrupt {
            reason: "incorrect frame checksum".to_string(),
            declared_len: Some(total),
        };
    }
    if read_u32(bytes, crc_at + 4) != FRAME_END {
        return FrameDecode::Corrupt {
            reason: "missing frame end marker".to_string(),
            declared_len: Some(total),
        };
    }

    FrameDecode::Complete(Frame {
        kind,
        payload: payload.to_vec(),
    })
}
