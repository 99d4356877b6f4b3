//! # CRC8-DVB-S2 Implementation
//!
//! CRC-8-DVB-S2 checksum used by MSP v2 frames.
//!
//! **Polynomial**: 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1)
//! **Initial Value**: 0x00
//!
//! MSP v2 covers `flag + command + length + payload` with the checksum, which
//! are not contiguous in a frame being built, so [`Crc8`] is incremental.

/// CRC-8-DVB-S2 polynomial
const CRC8_POLY: u8 = 0xD5;

/// Precomputed CRC8 lookup table for fast calculation
const CRC8_TABLE: [u8; 256] = generate_crc8_table();

/// Generate CRC8 lookup table at compile time
const fn generate_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Running CRC-8-DVB-S2 state
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc8 {
    value: u8,
}

impl Crc8 {
    /// Start a new checksum
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the checksum
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        for &byte in data {
            self.value = CRC8_TABLE[(self.value ^ byte) as usize];
        }
        self
    }

    /// Current checksum value
    pub fn finish(&self) -> u8 {
        self.value
    }
}

/// Calculate CRC8-DVB-S2 over a contiguous slice
///
/// # Examples
///
/// ```
/// use fc_link::msp::crc::crc8_dvb_s2;
///
/// // flag, command 70 (LE), length 0 (LE)
/// let crc = crc8_dvb_s2(&[0x00, 0x46, 0x00, 0x00, 0x00]);
/// assert_ne!(crc, 0);
/// ```
pub fn crc8_dvb_s2(data: &[u8]) -> u8 {
    Crc8::new().update(data).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference, used to check the table
    fn crc8_dvb_s2_bitwise(data: &[u8]) -> u8 {
        let mut crc: u8 = 0;

        for &byte in data {
            crc ^= byte;

            for _ in 0..8 {
                if (crc & 0x80) != 0 {
                    crc = (crc << 1) ^ CRC8_POLY;
                } else {
                    crc <<= 1;
                }
            }
        }

        crc
    }

    #[test]
    fn test_crc8_empty() {
        assert_eq!(crc8_dvb_s2(&[]), 0x00);
    }

    #[test]
    fn test_crc8_check_value() {
        // Catalogued check value for CRC-8/DVB-S2
        assert_eq!(crc8_dvb_s2(b"123456789"), 0xBC);
    }

    #[test]
    fn test_crc8_table_matches_bitwise() {
        let test_data = [
            vec![0x00, 0x46, 0x00, 0x00, 0x00],
            vec![0x00, 0x47, 0x00, 0x06, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10],
            vec![0xFF; 10],
            (0u8..=255).collect::<Vec<_>>(),
        ];

        for data in test_data.iter() {
            assert_eq!(
                crc8_dvb_s2(data),
                crc8_dvb_s2_bitwise(data),
                "CRC mismatch for data: {:02X?}",
                data
            );
        }
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let mut crc = Crc8::new();
        crc.update(&[0x00]).update(&[0x47, 0x00]).update(&[0x02, 0x00, 0xAB, 0xCD]);

        assert_eq!(crc.finish(), crc8_dvb_s2(&[0x00, 0x47, 0x00, 0x02, 0x00, 0xAB, 0xCD]));
    }
}
