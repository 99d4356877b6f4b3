//! Decoded blackbox frames

use serde::Serialize;
use std::sync::Arc;

/// Marker bytes starting each frame in the log body
pub const MARKER_INTRA: u8 = b'I';
pub const MARKER_INTER: u8 = b'P';
pub const MARKER_SLOW: u8 = b'S';
pub const MARKER_GPS: u8 = b'G';
pub const MARKER_GPS_HOME: u8 = b'H';
pub const MARKER_EVENT: u8 = b'E';

/// Whether `byte` can start a frame
pub fn is_marker(byte: u8) -> bool {
    matches!(
        byte,
        MARKER_INTRA | MARKER_INTER | MARKER_SLOW | MARKER_GPS | MARKER_GPS_HOME | MARKER_EVENT
    )
}

/// Events the logger writes between frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    SyncBeep { time_us: u32 },
    /// In-flight tuning change; `value` is the raw bits when `is_float`
    InflightAdjustment { function: u8, value: i32, is_float: bool },
    /// Logging paused and resumed; the main frame lineage restarts
    LoggingResume { iteration: u32, time_us: u32 },
    Disarm { reason: u32 },
    FlightMode { flags: u32, last_flags: u32 },
    LogEnd,
}

/// Which kind of frame was decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Key frame with full values
    Intra,
    /// Delta frame predicted from earlier main frames
    Inter,
    /// Low-rate state (flight modes, failsafe)
    Slow,
    Gps,
    GpsHome,
    Event(LogEvent),
}

impl FrameKind {
    /// Intra and inter frames form the main sample stream
    pub fn is_main(&self) -> bool {
        matches!(self, FrameKind::Intra | FrameKind::Inter)
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub kind: FrameKind,
    /// Offset of the marker byte in the log body
    pub offset: usize,
    /// Field names, shared by all frames of this kind
    pub names: Arc<[String]>,
    /// Resolved values in field order
    pub values: Vec<i64>,
}

impl DecodedFrame {
    /// Value of field `name`
    pub fn get(&self, name: &str) -> Option<i64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    /// Field name/value pairs in order
    pub fn fields(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Main-frame timestamp in microseconds
    pub fn time_us(&self) -> Option<i64> {
        if self.kind.is_main() {
            self.get("time")
        } else {
            None
        }
    }

    pub fn event(&self) -> Option<LogEvent> {
        match self.kind {
            FrameKind::Event(event) => Some(event),
            _ => None,
        }
    }
}
