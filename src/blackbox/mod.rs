//! # Blackbox Log Decoding
//!
//! Turns a raw dataflash image into flights.
//!
//! A capture may hold several logs back to back, each starting with its
//! own `H Product:` header. Every log is decoded independently: header
//! text first, then the binary frame stream, then arm/disarm segmentation.
//!
//! ## Layers
//!
//! - [`stream`]: byte reader and the variable-length encodings
//! - [`header`]: header lines into frame layouts and settings
//! - [`decoder`]: frame stream with prediction and resynchronization
//! - [`segment`]: frames into flights

pub mod decoder;
pub mod frame;
pub mod header;
pub mod segment;
pub mod stream;

pub use decoder::{decode_frames, DecodeContext, DecodeStats, FrameIter};
pub use frame::{DecodedFrame, FrameKind, LogEvent};
pub use header::{Encoding, FieldDef, FrameDef, LogHeader, Predictor};
pub use segment::{segment, FlightSegment, SegmentConfig, SegmentSummary};
pub use stream::{ByteReader, DecodeError};

use tracing::{info, warn};

use crate::error::{FcLinkError, Result};

/// First header line of every log
pub const LOG_START_MARKER: &[u8] = b"H Product:";

/// Flights of one log plus what the decoder had to skip
#[derive(Debug, Clone, PartialEq)]
pub struct FlightLog {
    pub segments: Vec<FlightSegment>,
    pub stats: DecodeStats,
}

/// One decoded log out of a capture
#[derive(Debug, Clone)]
pub struct CapturedLog {
    /// Position of the log in the capture
    pub index: usize,
    pub header: LogHeader,
    pub log: FlightLog,
}

/// Split a capture into logs
///
/// Bytes before the first header are erased flash or a truncated log and
/// are not returned. An empty vector means the capture holds no log.
pub fn split_logs(capture: &[u8]) -> Vec<&[u8]> {
    let starts: Vec<usize> = capture
        .windows(LOG_START_MARKER.len())
        .enumerate()
        .filter(|(_, window)| *window == LOG_START_MARKER)
        .map(|(pos, _)| pos)
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(capture.len());
            &capture[start..end]
        })
        .collect()
}

/// Parse the header of a single log
///
/// # Returns
///
/// The header and the binary body that follows it
///
/// # Errors
///
/// Returns [`FcLinkError::Header`] if the log has no header lines or the
/// header does not describe a decodable log
pub fn parse_log(log: &[u8]) -> Result<(LogHeader, &[u8])> {
    let (text, body) = header::split_header(log);
    if text.is_empty() {
        return Err(FcLinkError::Header("log has no header lines".to_string()));
    }
    Ok((LogHeader::parse(text)?, body))
}

/// Decode a log body and split it into flights
pub fn decode_log(header: &LogHeader, body: &[u8], config: &SegmentConfig) -> FlightLog {
    let (frames, stats) = decode_frames(header, body);

    if stats.skipped_bytes > 0 || stats.dropped_frames > 0 {
        warn!(
            "Log damaged: skipped {} bytes, dropped {} frames, {} resyncs",
            stats.skipped_bytes, stats.dropped_frames, stats.resyncs
        );
    }

    let segments = segment(frames, header, config);
    info!(
        "Decoded {} frames into {} flights{}",
        stats.frames,
        segments.len(),
        if stats.reached_log_end { "" } else { " (no log end marker)" }
    );

    FlightLog { segments, stats }
}

/// Decode every log in a capture
///
/// A log whose header fails to parse yields an error entry; the other
/// logs still decode.
pub fn decode_capture(capture: &[u8], config: &SegmentConfig) -> Vec<Result<CapturedLog>> {
    split_logs(capture)
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let (header, body) = parse_log(raw)?;
            info!(
                "Log {}: {} ({} bytes)",
                index,
                header.firmware_revision.as_deref().unwrap_or("unknown firmware"),
                raw.len()
            );
            let log = decode_log(&header, body, config);
            Ok(CapturedLog { index, header, log })
        })
        .collect()
}
