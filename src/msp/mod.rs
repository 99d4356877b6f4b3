//! # MSP Protocol Module
//!
//! Implementation of MSP v2 framing used to talk to INAV flight controllers.
//!
//! This module handles:
//! - Frame encoding (preamble, direction, flag, command, length, CRC)
//! - Frame decoding and validation
//! - Scanning a byte stream for the next valid frame
//! - CRC8-DVB-S2 checksum calculation

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;

pub use decoder::{FrameError, ScanOutcome};
pub use protocol::{Direction, MspFrame};
