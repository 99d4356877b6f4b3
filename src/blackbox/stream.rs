//! # Blackbox Byte Stream
//!
//! Cursor over a log body plus the variable-length and tagged-group
//! encodings frames are built from.
//!
//! All readers fail with [`DecodeError`] instead of panicking when the data
//! runs out or is malformed. The cursor position after a failed read is
//! unspecified; callers restart from a saved offset.

use thiserror::Error;

use super::header::Encoding;

/// Longest varint the logger ever writes (32 bits, 7 bits per byte)
const MAX_VARINT_BYTES: usize = 5;

/// Why a single frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    #[error("Variable-length integer longer than {MAX_VARINT_BYTES} bytes at offset {0}")]
    VarintTooLong(usize),

    #[error("Unknown frame marker 0x{0:02X}")]
    UnknownMarker(u8),

    #[error("No field definition for '{0}' frames")]
    MissingDefinition(char),

    #[error("Unknown event type {0}")]
    UnknownEvent(u8),

    #[error("Malformed log end marker")]
    BadLogEnd,

    #[error("Frame size {size} outside {min}..={max}")]
    SizeOutOfRange { size: usize, min: usize, max: usize },

    #[error("Implausible frame: {0}")]
    Implausible(String),

    #[error("Frame not followed by a marker")]
    NoTrailingMarker,
}

/// Read cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos: pos.min(data.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek().ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEnd(self.data.len()));
        }
        let bytes = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    /// Little-endian base-128 unsigned integer
    pub fn read_unsigned_vb(&mut self) -> Result<u32, DecodeError> {
        let start = self.pos;
        let mut result: u32 = 0;

        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            result |= u32::from(byte & 0x7F).wrapping_shl(7 * i as u32);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }

        Err(DecodeError::VarintTooLong(start))
    }

    /// Zig-zag encoded signed integer
    pub fn read_signed_vb(&mut self) -> Result<i32, DecodeError> {
        Ok(zigzag_decode(self.read_unsigned_vb()?))
    }

    /// Unsigned varint holding a negated 14-bit value
    pub fn read_neg_14bit(&mut self) -> Result<i32, DecodeError> {
        let raw = self.read_unsigned_vb()?;
        Ok(-sign_extend(raw & 0x3FFF, 14))
    }

    /// Up to 8 signed varints behind a presence bitmap.
    ///
    /// A single value is written as a bare varint with no bitmap.
    pub fn read_tag8_8svb(&mut self, out: &mut [i64]) -> Result<(), DecodeError> {
        if out.len() == 1 {
            out[0] = i64::from(self.read_signed_vb()?);
            return Ok(());
        }

        let mut header = self.read_u8()?;
        for value in out.iter_mut() {
            *value = if header & 0x01 != 0 {
                i64::from(self.read_signed_vb()?)
            } else {
                0
            };
            header >>= 1;
        }
        Ok(())
    }

    /// Three values, width chosen by the top two bits of the lead byte
    pub fn read_tag2_3s32(&mut self, out: &mut [i64; 3]) -> Result<(), DecodeError> {
        let lead = self.read_u8()?;

        match lead >> 6 {
            0 => {
                out[0] = sign_extend(u32::from((lead >> 4) & 0x03), 2).into();
                out[1] = sign_extend(u32::from((lead >> 2) & 0x03), 2).into();
                out[2] = sign_extend(u32::from(lead & 0x03), 2).into();
            }
            1 => {
                out[0] = sign_extend(u32::from(lead & 0x0F), 4).into();
                let next = self.read_u8()?;
                out[1] = sign_extend(u32::from(next >> 4), 4).into();
                out[2] = sign_extend(u32::from(next & 0x0F), 4).into();
            }
            2 => {
                out[0] = sign_extend(u32::from(lead & 0x3F), 6).into();
                out[1] = sign_extend(u32::from(self.read_u8()? & 0x3F), 6).into();
                out[2] = sign_extend(u32::from(self.read_u8()? & 0x3F), 6).into();
            }
            _ => self.read_sized_triplet(lead, out)?,
        }
        Ok(())
    }

    /// Three values in 2/5/8-bit or variable-width packing
    pub fn read_tag2_3svariable(&mut self, out: &mut [i64; 3]) -> Result<(), DecodeError> {
        let lead = self.read_u8()?;

        match lead >> 6 {
            0 => {
                out[0] = sign_extend(u32::from((lead >> 4) & 0x03), 2).into();
                out[1] = sign_extend(u32::from((lead >> 2) & 0x03), 2).into();
                out[2] = sign_extend(u32::from(lead & 0x03), 2).into();
            }
            1 => {
                // 5, 5 and 4 bits
                let b1 = u32::from(self.read_u8()?);
                let lead = u32::from(lead);
                out[0] = sign_extend((lead & 0x3E) >> 1, 5).into();
                out[1] = sign_extend(((lead & 0x01) << 4) | ((b1 & 0xF0) >> 4), 5).into();
                out[2] = sign_extend(b1 & 0x0F, 4).into();
            }
            2 => {
                // 8, 7 and 7 bits
                let b1 = u32::from(self.read_u8()?);
                let b2 = u32::from(self.read_u8()?);
                let lead = u32::from(lead);
                out[0] = sign_extend(((lead & 0x3F) << 2) | ((b1 & 0xC0) >> 6), 8).into();
                out[1] = sign_extend(((b1 & 0x3F) << 1) | ((b2 & 0x80) >> 7), 7).into();
                out[2] = sign_extend(b2 & 0x7F, 7).into();
            }
            _ => self.read_sized_triplet(lead, out)?,
        }
        Ok(())
    }

    /// Shared "selector" layout: two bits per value pick 1, 2, 3 or 4 bytes
    fn read_sized_triplet(&mut self, lead: u8, out: &mut [i64; 3]) -> Result<(), DecodeError> {
        let mut selector = lead;
        for value in out.iter_mut() {
            let width = usize::from(selector & 0x03) + 1;
            let bytes = self.read_bytes(width)?;
            let raw = bytes
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
            *value = sign_extend(raw, 8 * width as u32).into();
            selector >>= 2;
        }
        Ok(())
    }

    /// Four values of 0, 4, 8 or 16 bits packed on nibble boundaries
    pub fn read_tag8_4s16(&mut self, out: &mut [i64; 4]) -> Result<(), DecodeError> {
        let mut selector = self.read_u8()?;
        let mut nibble_pending = false;
        let mut buffer: u32 = 0;

        for value in out.iter_mut() {
            *value = match selector & 0x03 {
                0 => 0,
                1 => {
                    if nibble_pending {
                        nibble_pending = false;
                        sign_extend(buffer & 0x0F, 4).into()
                    } else {
                        buffer = u32::from(self.read_u8()?);
                        nibble_pending = true;
                        sign_extend(buffer >> 4, 4).into()
                    }
                }
                2 => {
                    if nibble_pending {
                        let high = (buffer & 0x0F) << 4;
                        buffer = u32::from(self.read_u8()?);
                        sign_extend(high | (buffer >> 4), 8).into()
                    } else {
                        sign_extend(u32::from(self.read_u8()?), 8).into()
                    }
                }
                _ => {
                    if nibble_pending {
                        let b1 = u32::from(self.read_u8()?);
                        let b2 = u32::from(self.read_u8()?);
                        let raw = ((buffer & 0x0F) << 12) | (b1 << 4) | (b2 >> 4);
                        buffer = b2;
                        sign_extend(raw, 16).into()
                    } else {
                        let b1 = u32::from(self.read_u8()?);
                        let b2 = u32::from(self.read_u8()?);
                        sign_extend((b1 << 8) | b2, 16).into()
                    }
                }
            };
            selector >>= 2;
        }
        Ok(())
    }

    /// Decode one encoding group into `out`, which holds as many slots as
    /// the group covers
    pub fn read_group(&mut self, encoding: Encoding, out: &mut [i64]) -> Result<(), DecodeError> {
        match encoding {
            Encoding::SignedVb => out[0] = i64::from(self.read_signed_vb()?),
            Encoding::UnsignedVb => out[0] = i64::from(self.read_unsigned_vb()?),
            Encoding::Neg14Bit => out[0] = i64::from(self.read_neg_14bit()?),
            Encoding::Null => out[0] = 0,
            Encoding::Tag8_8Svb => self.read_tag8_8svb(out)?,
            Encoding::Tag2_3S32 => {
                let mut triplet = [0i64; 3];
                self.read_tag2_3s32(&mut triplet)?;
                out.copy_from_slice(&triplet[..out.len()]);
            }
            Encoding::Tag2_3SVariable => {
                let mut triplet = [0i64; 3];
                self.read_tag2_3svariable(&mut triplet)?;
                out.copy_from_slice(&triplet[..out.len()]);
            }
            Encoding::Tag8_4S16 => {
                let mut quad = [0i64; 4];
                self.read_tag8_4s16(&mut quad)?;
                out.copy_from_slice(&quad[..out.len()]);
            }
        }
        Ok(())
    }
}

/// Undo zig-zag encoding
pub fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Interpret the low `bits` of `value` as two's complement
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}
