//! # MSP Frame Decoder
//!
//! [`decode`] parses one frame that must start at the first byte.
//! [`scan`] searches a receive buffer for the next valid frame.
//!
//! Raw dataflash payloads routinely contain `$X` by chance. A candidate that
//! fails validation is abandoned by advancing exactly one byte, never by its
//! declared length, so a real frame starting inside the bogus one is found.

use thiserror::Error;
use tracing::trace;

use super::crc::Crc8;
use super::protocol::*;

/// Single-frame failures. Recovered locally by rescanning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Bytes at the scan position are not `$X`
    #[error("Missing MSP v2 preamble")]
    MissingPreamble,

    /// Not enough bytes yet for the declared frame
    #[error("Frame incomplete: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// Direction byte is not `<`, `>` or `!`
    #[error("Unknown direction byte 0x{0:02X}")]
    UnknownDirection(u8),

    /// Declared payload length is implausible
    #[error("Payload length {0} exceeds maximum {MSP_MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// CRC does not match
    #[error("CRC mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Decode one MSP v2 frame from the start of `bytes`
///
/// # Returns
///
/// * `Result<(MspFrame, usize)>` - Frame and the number of bytes it occupied
///
/// # Errors
///
/// Returns error if:
/// - The preamble is absent
/// - The direction byte is unknown
/// - The declared length exceeds the available bytes or the sanity limit
/// - The CRC check fails
pub fn decode(bytes: &[u8]) -> Result<(MspFrame, usize), FrameError> {
    // A lone '$' may still become a preamble once more bytes arrive
    if bytes.is_empty() || (bytes.len() == 1 && bytes[0] == MSP_V2_PREAMBLE[0]) {
        return Err(FrameError::Incomplete {
            needed: MSP_MIN_FRAME_SIZE,
            available: bytes.len(),
        });
    }
    if bytes[..2] != MSP_V2_PREAMBLE {
        return Err(FrameError::MissingPreamble);
    }

    if bytes.len() < MSP_HEADER_SIZE {
        if bytes.len() > 2 && Direction::from_byte(bytes[2]).is_none() {
            return Err(FrameError::UnknownDirection(bytes[2]));
        }
        return Err(FrameError::Incomplete {
            needed: MSP_MIN_FRAME_SIZE,
            available: bytes.len(),
        });
    }

    let direction = Direction::from_byte(bytes[2]).ok_or(FrameError::UnknownDirection(bytes[2]))?;
    let flag = bytes[3];
    let command = u16::from_le_bytes([bytes[4], bytes[5]]);
    let length = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;

    if length > MSP_MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(length));
    }

    let total = MSP_MIN_FRAME_SIZE + length;
    if bytes.len() < total {
        return Err(FrameError::Incomplete {
            needed: total,
            available: bytes.len(),
        });
    }

    let payload = &bytes[MSP_HEADER_SIZE..MSP_HEADER_SIZE + length];
    let expected = Crc8::new().update(&bytes[3..MSP_HEADER_SIZE]).update(payload).finish();
    let actual = bytes[total - 1];

    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok((
        MspFrame {
            direction,
            flag,
            command,
            payload: payload.to_vec(),
        },
        total,
    ))
}

/// Result of scanning a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A valid frame occupies `buf[start..end]`; everything before `start` is junk
    Frame {
        frame: MspFrame,
        start: usize,
        end: usize,
    },

    /// No complete frame yet; the first `discard` bytes can never start one
    NeedMore { discard: usize },
}

/// Find the next valid frame in `buf`
///
/// Candidates failing validation are skipped one byte at a time. A candidate
/// that is merely incomplete is remembered but does not stop the search, so a
/// bogus preamble with a large declared length cannot hide a real frame that
/// is already fully buffered behind it.
pub fn scan(buf: &[u8]) -> ScanOutcome {
    let mut pos = 0;
    let mut pending: Option<usize> = None;

    while pos < buf.len() {
        let Some(offset) = buf[pos..].iter().position(|&b| b == MSP_V2_PREAMBLE[0]) else {
            break;
        };
        let start = pos + offset;

        match decode(&buf[start..]) {
            Ok((frame, len)) => {
                return ScanOutcome::Frame {
                    frame,
                    start,
                    end: start + len,
                };
            }
            Err(FrameError::Incomplete { .. }) => {
                pending.get_or_insert(start);
            }
            Err(FrameError::MissingPreamble) => {}
            Err(e) => {
                trace!("Rejected MSP candidate at offset {}: {}", start, e);
            }
        }

        pos = start + 1;
    }

    ScanOutcome::NeedMore {
        discard: pending.unwrap_or(buf.len()),
    }
}
