//! # Blackbox Log Header
//!
//! Parses the `H key:value` text block that precedes the binary frames and
//! turns the per-frame field declarations into [`FrameDef`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{FcLinkError, Result};

/// Header line prefix
const HEADER_LINE_PREFIX: &[u8] = b"H ";

/// The only body layout this decoder understands
pub const SUPPORTED_DATA_VERSION: u32 = 2;

/// Name of the field holding the motor value other motors are predicted from
const MOTOR0_FIELD: &str = "motor[0]";

/// Field encodings as numbered in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Zig-zag varint
    SignedVb,
    /// Varint
    UnsignedVb,
    /// Negated 14-bit value in a varint
    Neg14Bit,
    /// Up to 8 signed varints behind a presence bitmap
    Tag8_8Svb,
    /// Three values of 2, 4, 6 or 8-32 bits
    Tag2_3S32,
    /// Four values of 0, 4, 8 or 16 bits
    Tag8_4S16,
    /// Always zero, nothing stored
    Null,
    /// Three values of 2, 5-5-4, 8-7-7 or 8-32 bits
    Tag2_3SVariable,
}

impl Encoding {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Encoding::SignedVb),
            1 => Some(Encoding::UnsignedVb),
            3 => Some(Encoding::Neg14Bit),
            6 => Some(Encoding::Tag8_8Svb),
            7 => Some(Encoding::Tag2_3S32),
            8 => Some(Encoding::Tag8_4S16),
            9 => Some(Encoding::Null),
            10 => Some(Encoding::Tag2_3SVariable),
            _ => None,
        }
    }

    /// Most consecutive fields one encoded group covers
    pub fn group_limit(self) -> usize {
        match self {
            Encoding::Tag8_8Svb => 8,
            Encoding::Tag2_3S32 | Encoding::Tag2_3SVariable => 3,
            Encoding::Tag8_4S16 => 4,
            Encoding::SignedVb | Encoding::UnsignedVb | Encoding::Neg14Bit | Encoding::Null => 1,
        }
    }

    /// Smallest and largest encoded size of a group of `len` fields
    pub fn byte_bounds(self, len: usize) -> (usize, usize) {
        match self {
            Encoding::SignedVb | Encoding::UnsignedVb | Encoding::Neg14Bit => (1, 5),
            Encoding::Null => (0, 0),
            Encoding::Tag8_8Svb if len == 1 => (1, 5),
            Encoding::Tag8_8Svb => (1, 1 + 5 * len),
            Encoding::Tag2_3S32 | Encoding::Tag2_3SVariable => (1, 13),
            Encoding::Tag8_4S16 => (1, 9),
        }
    }
}

/// How a stored value combines with earlier data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predictor {
    /// Stored value is the value
    Zero,
    /// Delta from the same field in the previous frame
    Previous,
    /// Delta from `2 * previous - previous2`
    StraightLine,
    /// Delta from the mean of the last two frames
    Average2,
    /// Offset from the `minthrottle` setting
    MinThrottle,
    /// Offset from `motor[0]` in the same frame
    Motor0,
    /// Previous value plus one per logged iteration
    Increment,
    /// Offset from the GPS home coordinate
    HomeCoord,
    /// Offset from 1500
    Fixed1500,
    /// Offset from the `vbatref` setting
    VbatRef,
    /// Offset from the time of the last main frame
    LastMainFrameTime,
    /// Offset from the minimum motor output
    MinMotor,
}

impl Predictor {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Predictor::Zero),
            1 => Some(Predictor::Previous),
            2 => Some(Predictor::StraightLine),
            3 => Some(Predictor::Average2),
            4 => Some(Predictor::MinThrottle),
            5 => Some(Predictor::Motor0),
            6 => Some(Predictor::Increment),
            7 => Some(Predictor::HomeCoord),
            8 => Some(Predictor::Fixed1500),
            9 => Some(Predictor::VbatRef),
            10 => Some(Predictor::LastMainFrameTime),
            11 => Some(Predictor::MinMotor),
            _ => None,
        }
    }
}

/// One declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub signed: bool,
    pub predictor: Predictor,
    pub encoding: Encoding,
}

/// Consecutive fields decoded together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGroup {
    pub start: usize,
    pub len: usize,
    pub encoding: Encoding,
}

/// Field layout of one frame type
#[derive(Debug, Clone)]
pub struct FrameDef {
    pub fields: Vec<FieldDef>,
    names: Arc<[String]>,
    groups: Vec<FieldGroup>,
    min_size: usize,
    max_size: usize,
    motor0_index: Option<usize>,
}

impl FrameDef {
    /// Build a definition from parallel per-field lists
    ///
    /// # Errors
    ///
    /// Returns [`FcLinkError::Header`] if the lists differ in length, an id
    /// is unknown, or a predictor refers to a field that does not exist.
    pub fn new(
        kind: char,
        names: &[String],
        signed: &[u32],
        predictors: &[u32],
        encodings: &[u32],
    ) -> Result<Self> {
        let count = names.len();
        if count == 0 {
            return Err(header_error(format!("'{}' frame declares no fields", kind)));
        }
        if predictors.len() != count || encodings.len() != count {
            return Err(header_error(format!(
                "'{}' frame has {} names, {} predictors, {} encodings",
                kind,
                count,
                predictors.len(),
                encodings.len()
            )));
        }
        if !signed.is_empty() && signed.len() != count {
            return Err(header_error(format!(
                "'{}' frame has {} names but {} signedness flags",
                kind,
                count,
                signed.len()
            )));
        }

        let mut fields = Vec::with_capacity(count);
        for i in 0..count {
            let predictor = Predictor::from_id(predictors[i]).ok_or_else(|| {
                header_error(format!("unknown predictor {} for {}", predictors[i], names[i]))
            })?;
            let encoding = Encoding::from_id(encodings[i]).ok_or_else(|| {
                header_error(format!("unknown encoding {} for {}", encodings[i], names[i]))
            })?;
            fields.push(FieldDef {
                name: names[i].clone(),
                signed: signed.get(i).is_some_and(|&s| s != 0),
                predictor,
                encoding,
            });
        }

        let motor0_index = names.iter().position(|n| n == MOTOR0_FIELD);
        if motor0_index.is_none() && fields.iter().any(|f| f.predictor == Predictor::Motor0) {
            return Err(header_error(format!(
                "'{}' frame predicts from {} but does not log it",
                kind, MOTOR0_FIELD
            )));
        }
        if fields.iter().filter(|f| f.predictor == Predictor::HomeCoord).count() > 2 {
            return Err(header_error(format!(
                "'{}' frame has more than two home-relative fields",
                kind
            )));
        }

        let groups = group_fields(&fields);
        let (min_size, max_size) = groups.iter().fold((0, 0), |(min, max), g| {
            let (lo, hi) = g.encoding.byte_bounds(g.len);
            (min + lo, max + hi)
        });

        Ok(Self {
            fields,
            names: names.to_vec().into(),
            groups,
            min_size,
            max_size,
            motor0_index,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names, shared with every frame decoded from this definition
    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn groups(&self) -> &[FieldGroup] {
        &self.groups
    }

    /// Encoded size range of one frame body, marker excluded
    pub fn size_bounds(&self) -> (usize, usize) {
        (self.min_size, self.max_size)
    }

    pub fn motor0_index(&self) -> Option<usize> {
        self.motor0_index
    }
}

/// Split fields into runs sharing a grouped encoding
fn group_fields(fields: &[FieldDef]) -> Vec<FieldGroup> {
    let mut groups = Vec::new();
    let mut i = 0;

    while i < fields.len() {
        let encoding = fields[i].encoding;
        let limit = encoding.group_limit();
        let mut len = 1;
        while len < limit && i + len < fields.len() && fields[i + len].encoding == encoding {
            len += 1;
        }
        groups.push(FieldGroup {
            start: i,
            len,
            encoding,
        });
        i += len;
    }

    groups
}

/// Parsed log header
#[derive(Debug, Clone)]
pub struct LogHeader {
    pub product: String,
    pub data_version: u32,
    pub firmware_type: Option<String>,
    pub firmware_revision: Option<String>,
    pub craft_name: Option<String>,
    /// Main frames between two I frames
    pub i_interval: u32,
    /// `P interval` as numerator/denominator
    pub p_ratio: (u32, u32),
    pub min_throttle: Option<i64>,
    pub vbat_ref: Option<i64>,
    /// `motorOutput` as (min, max)
    pub motor_output: Option<(i64, i64)>,
    /// Intra (key) frame layout
    pub intra: FrameDef,
    /// Inter (delta) frame layout; names are the intra names
    pub inter: Option<FrameDef>,
    pub slow: Option<FrameDef>,
    pub gps: Option<FrameDef>,
    pub gps_home: Option<FrameDef>,
    /// Every header line, including the ones interpreted above
    pub settings: BTreeMap<String, String>,
}

impl LogHeader {
    /// Parse header text
    ///
    /// # Arguments
    ///
    /// * `text` - Header lines (`H key:value`), as split off by
    ///   [`split_header`]
    ///
    /// # Errors
    ///
    /// Returns [`FcLinkError::Header`] if the intra frame is not declared,
    /// a declaration is malformed, or the data version is unsupported.
    pub fn parse(text: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(text);
        let mut settings = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let Some(body) = line.strip_prefix("H ") else {
                continue;
            };
            if let Some((key, value)) = body.split_once(':') {
                settings.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let data_version = match settings.get("Data version") {
            Some(v) => parse_u32(v, "Data version")?,
            None => SUPPORTED_DATA_VERSION,
        };
        if data_version != SUPPORTED_DATA_VERSION {
            return Err(header_error(format!("unsupported data version {}", data_version)));
        }

        let i_interval = match settings.get("I interval") {
            Some(v) => parse_u32(v, "I interval")?.max(1),
            None => 32,
        };
        let p_ratio = match settings.get("P interval") {
            Some(v) => parse_ratio(v)?,
            None => (1, 1),
        };

        let intra_names = list(&settings, "Field I name");
        let intra = frame_def(&settings, 'I', &intra_names)?
            .ok_or_else(|| header_error("no 'I' frame field definitions"))?;
        let inter = frame_def(&settings, 'P', &intra_names)?;
        let slow = frame_def(&settings, 'S', &list(&settings, "Field S name"))?;
        let gps = frame_def(&settings, 'G', &list(&settings, "Field G name"))?;
        let gps_home = frame_def(&settings, 'H', &list(&settings, "Field H name"))?;

        let min_throttle = optional_i64(&settings, "minthrottle")?;
        let vbat_ref = optional_i64(&settings, "vbatref")?;
        let motor_output = match settings.get("motorOutput") {
            Some(v) => {
                let parts = parse_i64_list(v, "motorOutput")?;
                match parts.as_slice() {
                    [min, max, ..] => Some((*min, *max)),
                    [min] => Some((*min, *min)),
                    [] => None,
                }
            }
            None => None,
        };

        Ok(Self {
            product: settings.get("Product").cloned().unwrap_or_default(),
            data_version,
            firmware_type: settings.get("Firmware type").cloned(),
            firmware_revision: settings.get("Firmware revision").cloned(),
            craft_name: settings.get("Craft name").cloned(),
            i_interval,
            p_ratio,
            min_throttle,
            vbat_ref,
            motor_output,
            intra,
            inter,
            slow,
            gps,
            gps_home,
            settings,
        })
    }

    /// Lowest motor output: `motorOutput` min, else `minthrottle`
    pub fn min_motor(&self) -> Option<i64> {
        self.motor_output.map(|(min, _)| min).or(self.min_throttle)
    }

    /// Whether the logger writes the main frame at `iteration`, given the
    /// I interval and P ratio
    pub fn should_have_frame(&self, iteration: i64) -> bool {
        let (num, denom) = self.p_ratio;
        let (num, denom) = (i64::from(num), i64::from(denom));
        (iteration.rem_euclid(i64::from(self.i_interval)) + num - 1).rem_euclid(denom) < num
    }
}

fn header_error(message: impl Into<String>) -> FcLinkError {
    FcLinkError::Header(message.into())
}

fn list(settings: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    settings
        .get(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn numbers(settings: &BTreeMap<String, String>, key: &str) -> Result<Vec<u32>> {
    list(settings, key)
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| parse_u32(s, key))
        .collect()
}

/// Definition for frame `kind`, or `None` if it is not declared at all
fn frame_def(
    settings: &BTreeMap<String, String>,
    kind: char,
    names: &[String],
) -> Result<Option<FrameDef>> {
    let predictors = numbers(settings, &format!("Field {} predictor", kind))?;
    let encodings = numbers(settings, &format!("Field {} encoding", kind))?;
    if names.is_empty() || (predictors.is_empty() && encodings.is_empty()) {
        return Ok(None);
    }

    // P frames carry no names or signedness of their own
    let signed_kind = if kind == 'P' { 'I' } else { kind };
    let signed = numbers(settings, &format!("Field {} signed", signed_kind))?;

    FrameDef::new(kind, names, &signed, &predictors, &encodings).map(Some)
}

fn parse_u32(value: &str, key: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| header_error(format!("bad number {:?} for {}", value, key)))
}

fn parse_i64_list(value: &str, key: &str) -> Result<Vec<i64>> {
    value
        .split(',')
        .map(|s| {
            s.trim()
                .parse()
                .map_err(|_| header_error(format!("bad number {:?} for {}", s, key)))
        })
        .collect()
}

fn optional_i64(settings: &BTreeMap<String, String>, key: &str) -> Result<Option<i64>> {
    match settings.get(key) {
        Some(v) => Ok(parse_i64_list(v, key)?.first().copied()),
        None => Ok(None),
    }
}

fn parse_ratio(value: &str) -> Result<(u32, u32)> {
    let (num, denom) = match value.split_once('/') {
        Some((num, denom)) => (parse_u32(num, "P interval")?, parse_u32(denom, "P interval")?),
        None => (1, parse_u32(value, "P interval")?),
    };
    if num == 0 || denom == 0 || num > denom {
        return Err(header_error(format!("bad P interval {:?}", value)));
    }
    Ok((num, denom))
}

/// Split a log into its header lines and binary body
///
/// The header is every leading line starting with `H `.
pub fn split_header(log: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;

    while log[pos..].starts_with(HEADER_LINE_PREFIX) {
        match log[pos..].iter().position(|&b| b == b'\n') {
            Some(end) => pos += end + 1,
            None => {
                pos = log.len();
                break;
            }
        }
    }

    log.split_at(pos)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal INAV-style header used across the blackbox tests
    pub(crate) const TEST_HEADER: &str = "\
H Product:Blackbox flight data recorder by Nicholas Sherlock
H Data version:2
H I interval:32
H P interval:1/1
H Firmware type:Cleanflight
H Firmware revision:INAV 7.1.0 (abcdef) MATEKF405
H Craft name:QUAD5
H Field I name:loopIteration,time,axisP[0],rcCommand[3],motor[0],motor[1]
H Field I signed:0,0,1,0,0,0
H Field I predictor:0,0,0,0,11,5
H Field I encoding:1,1,0,1,1,0
H Field P predictor:6,2,1,1,1,1
H Field P encoding:9,0,0,0,8,8
H Field S name:flightModeFlags,stateFlags
H Field S signed:0,0
H Field S predictor:0,0
H Field S encoding:1,1
H Field G name:time,GPS_numSat,GPS_coord[0],GPS_coord[1]
H Field G signed:0,0,1,1
H Field G predictor:10,0,7,7
H Field G encoding:1,1,0,0
H Field H name:GPS_home[0],GPS_home[1]
H Field H signed:1,1
H Field H predictor:0,0
H Field H encoding:0,0
H minthrottle:1070
H vbatref:420
H motorOutput:1070,2000
";

    pub(crate) fn test_header() -> LogHeader {
        LogHeader::parse(TEST_HEADER.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_header() {
        let header = test_header();

        assert_eq!(header.data_version, 2);
        assert_eq!(header.i_interval, 32);
        assert_eq!(header.p_ratio, (1, 1));
        assert_eq!(header.craft_name.as_deref(), Some("QUAD5"));
        assert_eq!(header.min_throttle, Some(1070));
        assert_eq!(header.vbat_ref, Some(420));
        assert_eq!(header.motor_output, Some((1070, 2000)));
        assert_eq!(header.min_motor(), Some(1070));

        assert_eq!(header.intra.len(), 6);
        assert_eq!(header.intra.fields[2].name, "axisP[0]");
        assert!(header.intra.fields[2].signed);
        assert_eq!(header.intra.fields[4].predictor, Predictor::MinMotor);
        assert_eq!(header.intra.motor0_index(), Some(4));
        assert_eq!(header.settings["Firmware type"], "Cleanflight");
    }

    #[test]
    fn test_inter_frame_shares_intra_names() {
        let header = test_header();
        let inter = header.inter.unwrap();

        assert_eq!(inter.names(), header.intra.names());
        assert_eq!(inter.fields[0].predictor, Predictor::Increment);
        assert_eq!(inter.fields[0].encoding, Encoding::Null);
        assert!(inter.fields[2].signed);
    }

    #[test]
    fn test_field_groups() {
        let header = test_header();
        let inter = header.inter.unwrap();
        let groups: Vec<_> = inter.groups().iter().map(|g| (g.start, g.len)).collect();

        // Null, three single varints, then motors in one TAG8_4S16 group
        assert_eq!(groups, vec![(0, 1), (1, 1), (2, 1), (3, 1), (4, 2)]);
        assert_eq!(inter.size_bounds(), (1 + 1 + 1 + 1, 5 + 5 + 5 + 9));
    }

    #[test]
    fn test_tag8_8svb_groups_split_at_eight() {
        let names: Vec<String> = (0..10).map(|i| format!("f{}", i)).collect();
        let def = FrameDef::new('I', &names, &[], &[0; 10], &[6; 10]).unwrap();
        let lens: Vec<_> = def.groups().iter().map(|g| g.len).collect();
        assert_eq!(lens, vec![8, 2]);
    }

    #[test]
    fn test_missing_intra_definition() {
        let result = LogHeader::parse(b"H Product:Blackbox\nH Data version:2\n");
        assert!(matches!(result, Err(FcLinkError::Header(_))));
    }

    #[test]
    fn test_unsupported_data_version() {
        let text = TEST_HEADER.replace("Data version:2", "Data version:1");
        assert!(LogHeader::parse(text.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_predictor_rejected() {
        let text = TEST_HEADER.replace("H Field S predictor:0,0", "H Field S predictor:0,42");
        let err = LogHeader::parse(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown predictor 42"));
    }

    #[test]
    fn test_list_length_mismatch_rejected() {
        let text = TEST_HEADER.replace("H Field S encoding:1,1", "H Field S encoding:1");
        assert!(LogHeader::parse(text.as_bytes()).is_err());
    }

    #[test]
    fn test_motor0_predictor_needs_motor0() {
        let names = vec!["motor[1]".to_string()];
        assert!(FrameDef::new('I', &names, &[], &[5], &[0]).is_err());
    }

    #[test]
    fn test_should_have_frame() {
        let text = TEST_HEADER.replace("P interval:1/1", "P interval:1/2");
        let header = LogHeader::parse(text.as_bytes()).unwrap();

        assert_eq!(header.p_ratio, (1, 2));
        let logged: Vec<_> = (0..6).filter(|&i| header.should_have_frame(i)).collect();
        assert_eq!(logged, vec![0, 2, 4]);
    }

    #[test]
    fn test_bad_p_interval() {
        let text = TEST_HEADER.replace("P interval:1/1", "P interval:0/4");
        assert!(LogHeader::parse(text.as_bytes()).is_err());
    }

    #[test]
    fn test_split_header() {
        let mut log = b"H Product:Blackbox\nH Data version:2\n".to_vec();
        log.extend_from_slice(b"I\x00\x01");

        let (header, body) = split_header(&log);
        assert!(header.ends_with(b"version:2\n"));
        assert_eq!(body, b"I\x00\x01");
    }
}
