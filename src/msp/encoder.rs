//! # MSP Frame Encoder

use super::crc::Crc8;
use super::protocol::*;

/// Encode a complete MSP v2 frame
///
/// # Arguments
///
/// * `direction` - Direction tag
/// * `flag` - Flag byte
/// * `command` - Command id
/// * `payload` - Payload bytes (at most [`MSP_MAX_PAYLOAD_SIZE`] are meaningful)
///
/// # Returns
///
/// * `Vec<u8>` - Frame bytes: preamble, header, payload and CRC
///
/// # Examples
///
/// ```
/// use fc_link::msp::encoder::encode;
/// use fc_link::msp::protocol::{Direction, MSP_DATAFLASH_SUMMARY};
///
/// let frame = encode(Direction::Request, 0, MSP_DATAFLASH_SUMMARY, &[]);
/// assert_eq!(&frame[..3], b"$X<");
/// assert_eq!(frame.len(), 9);
/// ```
pub fn encode(direction: Direction, flag: u8, command: u16, payload: &[u8]) -> Vec<u8> {
    let command_bytes = command.to_le_bytes();
    let length_bytes = (payload.len() as u16).to_le_bytes();

    let crc = Crc8::new()
        .update(&[flag])
        .update(&command_bytes)
        .update(&length_bytes)
        .update(payload)
        .finish();

    let mut frame = Vec::with_capacity(MSP_MIN_FRAME_SIZE + payload.len());
    frame.extend_from_slice(&MSP_V2_PREAMBLE);
    frame.push(direction.as_byte());
    frame.push(flag);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&length_bytes);
    frame.extend_from_slice(payload);
    frame.push(crc);

    frame
}

/// Encode an [`MspFrame`]
pub fn encode_frame(frame: &MspFrame) -> Vec<u8> {
    encode(frame.direction, frame.flag, frame.command, &frame.payload)
}

/// Build the payload of a dataflash read request
///
/// `[address LE32][size LE16]`, without the trailing compression flag some
/// firmwares accept: FC Link always asks for uncompressed data.
pub fn encode_dataflash_read(address: u32, size: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&address.to_le_bytes());
    payload.extend_from_slice(&size.to_le_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msp::crc::crc8_dvb_s2;

    #[test]
    fn test_encode_empty_request_layout() {
        let frame = encode(Direction::Request, 0, MSP_DATAFLASH_SUMMARY, &[]);

        assert_eq!(
            &frame[..8],
            &[b'$', b'X', b'<', 0x00, 0x46, 0x00, 0x00, 0x00]
        );
        assert_eq!(frame[8], crc8_dvb_s2(&[0x00, 0x46, 0x00, 0x00, 0x00]));
    }

    #[test]
    fn test_encode_length_and_command_little_endian() {
        let payload = vec![0xAA; 0x0102];
        let frame = encode(Direction::Response, 0, 0x1234, &payload);

        assert_eq!(frame[4], 0x34);
        assert_eq!(frame[5], 0x12);
        assert_eq!(frame[6], 0x02);
        assert_eq!(frame[7], 0x01);
        assert_eq!(frame.len(), MSP_MIN_FRAME_SIZE + 0x0102);
    }

    #[test]
    fn test_crc_covers_flag_but_not_direction() {
        let a = encode(Direction::Request, 0, 1, &[]);
        let b = encode(Direction::Response, 0, 1, &[]);
        let c = encode(Direction::Request, 1, 1, &[]);

        assert_eq!(a.last(), b.last());
        assert_ne!(a.last(), c.last());
    }

    #[test]
    fn test_encode_dataflash_read() {
        let payload = encode_dataflash_read(0x0001_0203, 4096);
        assert_eq!(payload, vec![0x03, 0x02, 0x01, 0x00, 0x00, 0x10]);
    }
}
