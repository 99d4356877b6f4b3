//! # MSP v2 Protocol Constants and Types
//!
//! Frame layout (all multi-byte fields little-endian):
//!
//! ```text
//! +------+-----+------+---------+--------+---------+-----+
//! | $ X  | dir | flag | command | length | payload | crc |
//! |  2   |  1  |  1   |    2    |   2    |   len   |  1  |
//! +------+-----+------+---------+--------+---------+-----+
//! ```
//!
//! The CRC-8-DVB-S2 covers `flag`, `command`, `length` and `payload`.

/// MSP v2 preamble
pub const MSP_V2_PREAMBLE: [u8; 2] = *b"$X";

/// Bytes before the payload: preamble(2) + dir(1) + flag(1) + cmd(2) + len(2)
pub const MSP_HEADER_SIZE: usize = 8;

/// Smallest possible frame (empty payload)
pub const MSP_MIN_FRAME_SIZE: usize = MSP_HEADER_SIZE + 1;

/// Largest payload we accept. INAV's MSP buffers are far smaller; anything
/// above this is a coincidental preamble in binary data.
pub const MSP_MAX_PAYLOAD_SIZE: usize = 8192;

/// Bytes of the address echoed in front of every dataflash read response
pub const MSP_DATAFLASH_ADDRESS_SIZE: usize = 4;

/// Largest dataflash read whose response still fits [`MSP_MAX_PAYLOAD_SIZE`]
pub const MSP_MAX_CHUNK_SIZE: u16 = (MSP_MAX_PAYLOAD_SIZE - MSP_DATAFLASH_ADDRESS_SIZE) as u16;

/// MSP command ids used by FC Link
pub const MSP_API_VERSION: u16 = 1;
pub const MSP_FC_VARIANT: u16 = 2;
pub const MSP_FC_VERSION: u16 = 3;
pub const MSP_BOARD_INFO: u16 = 4;
pub const MSP_NAME: u16 = 10;
pub const MSP_DATAFLASH_SUMMARY: u16 = 70;
pub const MSP_DATAFLASH_READ: u16 = 71;
pub const MSP_DATAFLASH_ERASE: u16 = 72;

/// Frame direction tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to FC (`<`)
    Request,
    /// FC to host (`>`)
    Response,
    /// FC refused the command (`!`)
    Error,
}

impl Direction {
    /// Wire byte for this direction
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::Request => b'<',
            Direction::Response => b'>',
            Direction::Error => b'!',
        }
    }

    /// Parse a direction byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'<' => Some(Direction::Request),
            b'>' => Some(Direction::Response),
            b'!' => Some(Direction::Error),
            _ => None,
        }
    }
}

/// One MSP v2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspFrame {
    /// Direction tag
    pub direction: Direction,

    /// Flag byte (0 for everything FC Link sends)
    pub flag: u8,

    /// Command id
    pub command: u16,

    /// Payload data
    pub payload: Vec<u8>,
}

impl MspFrame {
    /// Build a request frame with flag 0
    pub fn request(command: u16, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Request,
            flag: 0,
            command,
            payload,
        }
    }

    /// Build a response frame with flag 0
    pub fn response(command: u16, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Response,
            flag: 0,
            command,
            payload,
        }
    }

    /// Total encoded size in bytes
    pub fn wire_len(&self) -> usize {
        MSP_MIN_FRAME_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(&MSP_V2_PREAMBLE, b"$X");
        assert_eq!(MSP_HEADER_SIZE, 8);
        assert_eq!(MSP_MIN_FRAME_SIZE, 9);
        assert_eq!(MSP_DATAFLASH_READ, 71);
        assert_eq!(MSP_MAX_CHUNK_SIZE, 8188);
    }

    #[test]
    fn test_direction_bytes() {
        for dir in [Direction::Request, Direction::Response, Direction::Error] {
            assert_eq!(Direction::from_byte(dir.as_byte()), Some(dir));
        }
        assert_eq!(Direction::from_byte(b'?'), None);
    }

    #[test]
    fn test_wire_len() {
        let frame = MspFrame::request(MSP_DATAFLASH_READ, vec![0u8; 6]);
        assert_eq!(frame.wire_len(), 15);
    }
}
