//! # Flight Segmentation
//!
//! Splits a decoded frame stream into flights, one per arm/disarm cycle.
//!
//! The arm state comes from a configurable field (a flag bit in the slow
//! frames by default) plus DISARM events. Logs that do not carry such a
//! field fall back to motor or throttle activity. Cycles shorter than the
//! configured minimum are dropped.

use serde::Serialize;
use tracing::debug;

use super::frame::{DecodedFrame, FrameKind, LogEvent};
use super::header::LogHeader;
use crate::config::DecodeConfig;

/// Field name some firmware uses for a plain 0/1 arm state
const ARMED_FIELD: &str = "armed";

/// Throttle channel used when no motor outputs are logged
const THROTTLE_FIELD: &str = "rcCommand[3]";

/// Motor output that counts as spinning when the header has no motor range
const DEFAULT_ACTIVITY_THRESHOLD: i64 = 1050;

/// Segmentation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Shorter arm cycles are not flights
    pub min_duration_us: i64,
    /// Field carrying the arm state
    pub arming_field: String,
    /// Bit of `arming_field` set while armed
    pub arming_bit: u8,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::from(&DecodeConfig::default())
    }
}

impl From<&DecodeConfig> for SegmentConfig {
    fn from(config: &DecodeConfig) -> Self {
        Self {
            min_duration_us: (config.min_flight_duration_ms as i64).saturating_mul(1000),
            arming_field: config.arming_field.clone(),
            arming_bit: config.arming_bit,
        }
    }
}

/// One flight
#[derive(Debug, Clone, PartialEq)]
pub struct FlightSegment {
    /// Position among the accepted flights of this log
    pub index: usize,
    pub start_time_us: i64,
    pub end_time_us: i64,
    /// Every frame from the arming transition up to the disarm
    pub frames: Vec<DecodedFrame>,
}

/// What gets printed for a flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSummary {
    pub index: usize,
    pub start_time_us: i64,
    pub duration_s: f64,
    pub main_frames: usize,
    pub events: Vec<LogEvent>,
}

impl FlightSegment {
    pub fn duration_us(&self) -> i64 {
        self.end_time_us - self.start_time_us
    }

    /// Intra and inter frames only
    pub fn main_frames(&self) -> impl Iterator<Item = &DecodedFrame> {
        self.frames.iter().filter(|f| f.kind.is_main())
    }

    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            index: self.index,
            start_time_us: self.start_time_us,
            duration_s: self.duration_us() as f64 / 1_000_000.0,
            main_frames: self.main_frames().count(),
            events: self.frames.iter().filter_map(DecodedFrame::event).collect(),
        }
    }
}

/// Where the arm state is read from
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArmSignal {
    /// A flag bit in a field of slow (`slow == true`) or main frames
    Flag { slow: bool, index: usize, bit: u8 },
    /// Highest of these main-frame fields at or above a threshold
    Activity { fields: Vec<usize>, threshold: i64 },
    /// Nothing usable; the whole log is one candidate flight
    Unavailable,
}

impl ArmSignal {
    fn for_header(header: &LogHeader, config: &SegmentConfig) -> Self {
        let candidates = [
            (config.arming_field.as_str(), config.arming_bit),
            (ARMED_FIELD, 0),
        ];

        for (name, bit) in candidates {
            if let Some(index) = header.slow.as_ref().and_then(|d| d.index_of(name)) {
                return ArmSignal::Flag { slow: true, index, bit };
            }
            if let Some(index) = header.intra.index_of(name) {
                return ArmSignal::Flag { slow: false, index, bit };
            }
        }

        let threshold = header.min_motor().unwrap_or(DEFAULT_ACTIVITY_THRESHOLD);
        let motors: Vec<usize> = (0..)
            .map_while(|i| header.intra.index_of(&format!("motor[{}]", i)))
            .collect();
        if !motors.is_empty() {
            return ArmSignal::Activity { fields: motors, threshold };
        }
        if let Some(index) = header.intra.index_of(THROTTLE_FIELD) {
            return ArmSignal::Activity { fields: vec![index], threshold };
        }

        ArmSignal::Unavailable
    }

    /// Arm state this frame reports, if it reports one
    fn state(&self, frame: &DecodedFrame) -> Option<bool> {
        if let FrameKind::Event(LogEvent::Disarm { .. }) = frame.kind {
            return Some(false);
        }

        match self {
            ArmSignal::Flag { slow, index, bit } => {
                let applies = if *slow {
                    frame.kind == FrameKind::Slow
                } else {
                    frame.kind.is_main()
                };
                if !applies {
                    return None;
                }
                let value = *frame.values.get(*index)?;
                Some((value >> bit) & 1 != 0)
            }
            ArmSignal::Activity { fields, threshold } => {
                if !frame.kind.is_main() {
                    return None;
                }
                let highest = fields.iter().filter_map(|&i| frame.values.get(i)).max()?;
                Some(*highest >= *threshold)
            }
            ArmSignal::Unavailable => None,
        }
    }
}

/// Split frames into flights
///
/// # Arguments
///
/// * `frames` - Decoded frames in stream order
/// * `header` - Header the frames were decoded with
/// * `config` - Arm field and minimum duration
///
/// # Returns
///
/// Flights in stream order. Each holds the frames from its arming
/// transition up to (not including) the frame that reports the disarm;
/// a flight still armed at the end of the stream runs to the last frame.
pub fn segment<I>(frames: I, header: &LogHeader, config: &SegmentConfig) -> Vec<FlightSegment>
where
    I: IntoIterator<Item = DecodedFrame>,
{
    let signal = ArmSignal::for_header(header, config);
    debug!("Arm state source: {:?}", signal);

    let always_armed = signal == ArmSignal::Unavailable;
    let mut segments = Vec::new();
    let mut current: Option<Vec<DecodedFrame>> = always_armed.then(Vec::new);

    for frame in frames {
        match (signal.state(&frame), current.is_some()) {
            (Some(true), false) => current = Some(Vec::new()),
            (Some(false), true) => {
                if let Some(flight) = current.take() {
                    close_segment(flight, config, &mut segments);
                }
                continue;
            }
            _ => {}
        }

        if let Some(flight) = current.as_mut() {
            flight.push(frame);
        }
    }

    if let Some(flight) = current {
        close_segment(flight, config, &mut segments);
    }

    segments
}

fn close_segment(frames: Vec<DecodedFrame>, config: &SegmentConfig, out: &mut Vec<FlightSegment>) {
    let mut times = frames.iter().filter_map(DecodedFrame::time_us);
    let Some(start) = times.next() else {
        debug!("Dropping arm cycle without main frames");
        return;
    };
    let end = times.last().unwrap_or(start);

    if end - start < config.min_duration_us {
        debug!(
            "Dropping {} ms arm cycle (minimum {} ms)",
            (end - start) / 1000,
            config.min_duration_us / 1000
        );
        return;
    }

    out.push(FlightSegment {
        index: out.len(),
        start_time_us: start,
        end_time_us: end,
        frames,
    });
}
