//! # Blackbox Frame Decoder
//!
//! Turns a log body into [`DecodedFrame`]s.
//!
//! The format has no per-frame checksum, so corruption is detected
//! structurally: a frame must decode completely, fit the size range its
//! definition allows, and keep iteration and time moving forward. When a
//! frame fails, decoding restarts one byte later and every byte passed over
//! is counted. The first frame after skipped bytes is only trusted if another
//! marker (or the end of data) follows it; an intra frame accepted that way
//! re-anchors the iteration and time bounds, so a gap of any length heals.
//!
//! Predictor state lives in an explicit [`DecodeContext`]. Decoding a frame
//! reads the context; only an accepted frame updates it.

use serde::Serialize;
use tracing::debug;

use super::frame::*;
use super::header::{FrameDef, LogHeader, Predictor};
use super::stream::{ByteReader, DecodeError};

/// Largest forward jump in loop iterations between main frames
const MAX_ITERATION_JUMP: i64 = 500 * 10;

/// Largest forward jump in time between main frames
const MAX_TIME_JUMP_US: i64 = 10 * 1_000_000;

/// Trailer of the LOG_END event
const LOG_END_MESSAGE: &[u8] = b"End of log\0";

/// Event type ids
const EVENT_SYNC_BEEP: u8 = 0;
const EVENT_INFLIGHT_ADJUSTMENT: u8 = 13;
const EVENT_LOGGING_RESUME: u8 = 14;
const EVENT_DISARM: u8 = 15;
const EVENT_FLIGHT_MODE: u8 = 30;
const EVENT_LOG_END: u8 = 255;

/// Bit marking a float payload on an in-flight adjustment
const ADJUSTMENT_FLOAT_FLAG: u8 = 0x80;

/// Counters for one decode pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    /// Frames returned to the caller
    pub frames: usize,
    /// Well-formed frames discarded because their predictor state was missing
    pub dropped_frames: usize,
    /// Bytes passed over while resynchronizing
    pub skipped_bytes: usize,
    /// Separate runs of skipped bytes
    pub resyncs: usize,
    /// Frame candidates that failed to decode
    pub decode_failures: usize,
    /// Whether a LOG_END event was seen
    pub reached_log_end: bool,
}

/// Predictor state carried between frames of one decode pass
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    /// Most recent main frame
    previous: Option<Vec<i64>>,
    /// The one before it (equal to `previous` right after an intra frame)
    previous2: Option<Vec<i64>>,
    /// Whether inter frames can be resolved
    main_valid: bool,
    last_iteration: Option<i64>,
    last_time: Option<i64>,
    last_gps: Option<Vec<i64>>,
    home: Option<[i64; 2]>,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an inter frame decoded now would have a valid lineage
    pub fn main_valid(&self) -> bool {
        self.main_valid
    }

    /// Forget the main lineage; inter frames are dropped until the next intra frame
    pub fn invalidate_main(&mut self) {
        self.main_valid = false;
    }

    /// Fold an accepted frame into the context
    fn commit(&mut self, frame: &DecodedFrame, header: &LogHeader) {
        match frame.kind {
            FrameKind::Intra => {
                self.previous = Some(frame.values.clone());
                self.previous2 = Some(frame.values.clone());
                self.main_valid = true;
                self.note_main(frame, header);
            }
            FrameKind::Inter => {
                self.previous2 = self.previous.take();
                self.previous = Some(frame.values.clone());
                self.note_main(frame, header);
            }
            FrameKind::Gps => self.last_gps = Some(frame.values.clone()),
            FrameKind::GpsHome => {
                if let [lat, lon, ..] = frame.values[..] {
                    self.home = Some([lat, lon]);
                }
            }
            FrameKind::Event(LogEvent::LoggingResume { iteration, time_us }) => {
                self.main_valid = false;
                self.last_iteration = Some(i64::from(iteration));
                self.last_time = Some(i64::from(time_us));
            }
            FrameKind::Slow | FrameKind::Event(_) => {}
        }
    }

    fn note_main(&mut self, frame: &DecodedFrame, header: &LogHeader) {
        if let Some(i) = header.intra.index_of("loopIteration") {
            self.last_iteration = Some(frame.values[i]);
        }
        if let Some(i) = header.intra.index_of("time") {
            self.last_time = Some(frame.values[i]);
        }
    }

    /// Iterations the logger skipped on purpose since the last main frame
    fn skipped_iterations(&self, header: &LogHeader) -> i64 {
        let Some(last) = self.last_iteration else {
            return 0;
        };
        let bound = i64::from(header.p_ratio.1) * i64::from(header.i_interval);
        (1..=bound)
            .take_while(|&step| !header.should_have_frame(last + step))
            .count() as i64
    }
}

/// A frame decoded against a context, not yet accepted
struct Decoded {
    frame: DecodedFrame,
    /// End offset of the frame in the body
    end: usize,
    /// False if predictor state was missing; the frame is consumed but dropped
    usable: bool,
}

/// Per-frame inputs to [`predict`]
struct Prediction<'a> {
    header: &'a LogHeader,
    ctx: &'a DecodeContext,
    previous: Option<&'a [i64]>,
    previous2: Option<&'a [i64]>,
    skipped: i64,
}

/// Resolve one field
///
/// Returns `None` if the predictor needs state that is not available yet.
fn predict(
    p: &Prediction<'_>,
    def: &FrameDef,
    index: usize,
    raw: i64,
    current: &[i64],
    home_slot: &mut usize,
) -> Option<i64> {
    let prev = |values: Option<&[i64]>| values.map_or(0, |v| v[index]);

    let base = match def.fields[index].predictor {
        Predictor::Zero => 0,
        Predictor::Previous => prev(p.previous),
        Predictor::StraightLine => 2 * prev(p.previous) - prev(p.previous2),
        Predictor::Average2 => (prev(p.previous) + prev(p.previous2)) / 2,
        Predictor::MinThrottle => p.header.min_throttle.unwrap_or(0),
        Predictor::Motor0 => def.motor0_index().map_or(0, |m| current[m]),
        Predictor::Increment => prev(p.previous) + 1 + p.skipped,
        Predictor::HomeCoord => {
            let slot = (*home_slot).min(1);
            *home_slot += 1;
            p.ctx.home?[slot]
        }
        Predictor::Fixed1500 => 1500,
        Predictor::VbatRef => p.header.vbat_ref.unwrap_or(0),
        Predictor::LastMainFrameTime => p.ctx.last_time?,
        Predictor::MinMotor => p.header.min_motor().unwrap_or(0),
    };

    let value = base + raw;
    Some(if def.fields[index].signed {
        i64::from(value as i32)
    } else {
        i64::from(value as u32)
    })
}

/// Decode the fields of one frame
///
/// Returns the values and whether every predictor had its state.
fn decode_fields(
    reader: &mut ByteReader<'_>,
    def: &FrameDef,
    p: &Prediction<'_>,
) -> Result<(Vec<i64>, bool), DecodeError> {
    let start = reader.position();
    let mut values = vec![0i64; def.len()];
    let mut raw = [0i64; 8];
    let mut usable = true;
    let mut home_slot = 0;

    for group in def.groups() {
        let raw = &mut raw[..group.len];
        reader.read_group(group.encoding, raw)?;

        for (offset, &delta) in raw.iter().enumerate() {
            let index = group.start + offset;
            match predict(p, def, index, delta, &values, &mut home_slot) {
                Some(v) => values[index] = v,
                None => usable = false,
            }
        }
    }

    let size = reader.position() - start;
    let (min, max) = def.size_bounds();
    if size < min || size > max {
        return Err(DecodeError::SizeOutOfRange { size, min, max });
    }

    Ok((values, usable))
}

fn decode_event(reader: &mut ByteReader<'_>) -> Result<LogEvent, DecodeError> {
    let kind = reader.read_u8()?;

    Ok(match kind {
        EVENT_SYNC_BEEP => LogEvent::SyncBeep {
            time_us: reader.read_unsigned_vb()?,
        },
        EVENT_INFLIGHT_ADJUSTMENT => {
            let function = reader.read_u8()?;
            if function & ADJUSTMENT_FLOAT_FLAG != 0 {
                let bytes = reader.read_bytes(4)?;
                LogEvent::InflightAdjustment {
                    function: function & !ADJUSTMENT_FLOAT_FLAG,
                    value: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    is_float: true,
                }
            } else {
                LogEvent::InflightAdjustment {
                    function,
                    value: reader.read_signed_vb()?,
                    is_float: false,
                }
            }
        }
        EVENT_LOGGING_RESUME => LogEvent::LoggingResume {
            iteration: reader.read_unsigned_vb()?,
            time_us: reader.read_unsigned_vb()?,
        },
        EVENT_DISARM => LogEvent::Disarm {
            reason: reader.read_unsigned_vb()?,
        },
        EVENT_FLIGHT_MODE => LogEvent::FlightMode {
            flags: reader.read_unsigned_vb()?,
            last_flags: reader.read_unsigned_vb()?,
        },
        EVENT_LOG_END => {
            if reader.read_bytes(LOG_END_MESSAGE.len())? != LOG_END_MESSAGE {
                return Err(DecodeError::BadLogEnd);
            }
            LogEvent::LogEnd
        }
        other => return Err(DecodeError::UnknownEvent(other)),
    })
}

/// Reject main frames whose iteration or time moved backwards or jumped too far
fn check_main_plausible(
    header: &LogHeader,
    ctx: &DecodeContext,
    values: &[i64],
) -> Result<(), DecodeError> {
    if let (Some(i), Some(last)) = (header.intra.index_of("loopIteration"), ctx.last_iteration) {
        let iteration = values[i];
        if iteration < last || iteration > last + MAX_ITERATION_JUMP {
            return Err(DecodeError::Implausible(format!(
                "iteration {} after {}",
                iteration, last
            )));
        }
    }
    if let (Some(i), Some(last)) = (header.intra.index_of("time"), ctx.last_time) {
        let time = values[i];
        if time < last || time > last + MAX_TIME_JUMP_US {
            return Err(DecodeError::Implausible(format!("time {} after {}", time, last)));
        }
    }
    Ok(())
}

/// Decode the frame whose marker is at `start`
///
/// With `anchored` unset (right after skipped bytes) an intra frame is not
/// held to the iteration and time bounds; it becomes the new anchor.
fn decode_frame(
    header: &LogHeader,
    data: &[u8],
    start: usize,
    ctx: &DecodeContext,
    anchored: bool,
) -> Result<Decoded, DecodeError> {
    let mut reader = ByteReader::at(data, start);
    let marker = reader.read_u8()?;

    let empty = Prediction {
        header,
        ctx,
        previous: None,
        previous2: None,
        skipped: 0,
    };

    let (kind, def, values, usable) = match marker {
        MARKER_INTRA => {
            let def = &header.intra;
            let (values, usable) = decode_fields(&mut reader, def, &empty)?;
            if anchored {
                check_main_plausible(header, ctx, &values)?;
            }
            (FrameKind::Intra, def, values, usable)
        }
        MARKER_INTER => {
            let def = header
                .inter
                .as_ref()
                .ok_or(DecodeError::MissingDefinition('P'))?;
            let p = Prediction {
                previous: ctx.previous.as_deref(),
                previous2: ctx.previous2.as_deref(),
                skipped: ctx.skipped_iterations(header),
                ..empty
            };
            let (values, usable) = decode_fields(&mut reader, def, &p)?;
            let usable = usable && ctx.main_valid;
            if usable {
                check_main_plausible(header, ctx, &values)?;
            }
            (FrameKind::Inter, def, values, usable)
        }
        MARKER_SLOW => {
            let def = header
                .slow
                .as_ref()
                .ok_or(DecodeError::MissingDefinition('S'))?;
            let (values, usable) = decode_fields(&mut reader, def, &empty)?;
            (FrameKind::Slow, def, values, usable)
        }
        MARKER_GPS => {
            let def = header
                .gps
                .as_ref()
                .ok_or(DecodeError::MissingDefinition('G'))?;
            let p = Prediction {
                previous: ctx.last_gps.as_deref(),
                ..empty
            };
            let (values, usable) = decode_fields(&mut reader, def, &p)?;
            (FrameKind::Gps, def, values, usable)
        }
        MARKER_GPS_HOME => {
            let def = header
                .gps_home
                .as_ref()
                .ok_or(DecodeError::MissingDefinition('H'))?;
            let (values, usable) = decode_fields(&mut reader, def, &empty)?;
            (FrameKind::GpsHome, def, values, usable)
        }
        MARKER_EVENT => {
            let event = decode_event(&mut reader)?;
            return Ok(Decoded {
                frame: DecodedFrame {
                    kind: FrameKind::Event(event),
                    offset: start,
                    names: Vec::new().into(),
                    values: Vec::new(),
                },
                end: reader.position(),
                usable: true,
            });
        }
        other => return Err(DecodeError::UnknownMarker(other)),
    };

    Ok(Decoded {
        frame: DecodedFrame {
            kind,
            offset: start,
            names: def.names().clone(),
            values,
        },
        end: reader.position(),
        usable,
    })
}

/// Lazy iterator over the frames of one log body
///
/// Re-create it over the same body to decode again; it holds no state
/// beyond the current pass.
pub struct FrameIter<'a> {
    header: &'a LogHeader,
    data: &'a [u8],
    pos: usize,
    ctx: DecodeContext,
    stats: DecodeStats,
    /// Bytes were skipped since the last accepted frame
    resyncing: bool,
    finished: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(header: &'a LogHeader, data: &'a [u8]) -> Self {
        Self {
            header,
            data,
            pos: 0,
            ctx: DecodeContext::new(),
            stats: DecodeStats::default(),
            resyncing: false,
            finished: false,
        }
    }

    /// Counters so far; final once the iterator is exhausted
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Predictor state after the last accepted frame
    pub fn context(&self) -> &DecodeContext {
        &self.ctx
    }

    fn skip_byte(&mut self) {
        if !self.resyncing {
            debug!("Resynchronizing at body offset {}", self.pos);
            self.resyncing = true;
            self.stats.resyncs += 1;
            self.ctx.invalidate_main();
        }
        self.stats.skipped_bytes += 1;
        self.pos += 1;
    }

    fn reject(&mut self, start: usize, error: DecodeError) {
        debug!("Frame at body offset {} rejected: {}", start, error);
        self.stats.decode_failures += 1;
        self.pos = start;
        self.skip_byte();
    }
}

impl Iterator for FrameIter<'_> {
    type Item = DecodedFrame;

    fn next(&mut self) -> Option<DecodedFrame> {
        while !self.finished {
            let start = self.pos;
            let Some(&byte) = self.data.get(start) else {
                self.finished = true;
                break;
            };

            if !is_marker(byte) {
                self.skip_byte();
                continue;
            }

            let anchored = !self.resyncing;
            let decoded = match decode_frame(self.header, self.data, start, &self.ctx, anchored) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.reject(start, e);
                    continue;
                }
            };

            if self.resyncing && !self.data.get(decoded.end).map_or(true, |&b| is_marker(b)) {
                self.reject(start, DecodeError::NoTrailingMarker);
                continue;
            }

            self.resyncing = false;
            self.pos = decoded.end;

            if decoded.frame.event() == Some(LogEvent::LogEnd) {
                self.stats.reached_log_end = true;
                self.finished = true;
            }

            if decoded.usable {
                self.ctx.commit(&decoded.frame, self.header);
                self.stats.frames += 1;
                return Some(decoded.frame);
            }
            self.stats.dropped_frames += 1;
        }
        None
    }
}

/// Decode a whole body
pub fn decode_frames(header: &LogHeader, body: &[u8]) -> (Vec<DecodedFrame>, DecodeStats) {
    let mut iter = FrameIter::new(header, body);
    let frames: Vec<_> = iter.by_ref().collect();
    (frames, iter.stats())
}
