//! Historical sample model shared with the live-subscription layer.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::constants::TEXT_TIMESTAMP_FORMAT;

/// Alarm severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

impl Severity {
    pub fn code(self) -> i32 {
        match self {
            Severity::NoAlarm => 0,
            Severity::Minor => 1,
            Severity::Major => 2,
            Severity::Invalid => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NO_ALARM" | "0" => Ok(Severity::NoAlarm),
            "MINOR" | "1" => Ok(Severity::Minor),
            "MAJOR" | "2" => Ok(Severity::Major),
            "INVALID" | "3" => Ok(Severity::Invalid),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Classification of a severity code as sent by an archiver. Archivers encode
/// recording events (disconnects, archiving switched off) in the severity
/// field using codes above the EPICS alarm range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireSeverity {
    Alarm(Severity),
    /// Recording dropout: disconnected, archiving stopped or disabled.
    Dropout,
    /// Repeat-count sample; the value is unchanged since the previous sample.
    Repeat,
}

impl WireSeverity {
    const DISABLED: i32 = 0x0f08;
    const REPEAT: i32 = 0x0f10;
    const STOPPED: i32 = 0x0f20;
    const DISCONNECTED: i32 = 0x0f40;
    const EST_REPEAT: i32 = 0x0f80;

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WireSeverity::Alarm(Severity::NoAlarm),
            1 => WireSeverity::Alarm(Severity::Minor),
            2 => WireSeverity::Alarm(Severity::Major),
            Self::DISABLED | Self::STOPPED | Self::DISCONNECTED => WireSeverity::Dropout,
            Self::REPEAT | Self::EST_REPEAT => WireSeverity::Repeat,
            _ => WireSeverity::Alarm(Severity::Invalid),
        }
    }
}

static STATUS_NAMES: [&str; 22] = [
    "NO_ALARM",
    "READ",
    "WRITE",
    "HIHI",
    "HIGH",
    "LOLO",
    "LOW",
    "STATE",
    "COS",
    "COMM",
    "TIMEOUT",
    "HWLIMIT",
    "CALC",
    "SCAN",
    "LINK",
    "SOFT",
    "BAD_SUB",
    "UDF",
    "DISABLE",
    "SIMM",
    "READ_ACCESS",
    "WRITE_ACCESS",
];

/// EPICS alarm status code (the category that raised the severity).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmStatus(pub u16);

impl AlarmStatus {
    pub const NO_ALARM: AlarmStatus = AlarmStatus(0);
    pub const COMM: AlarmStatus = AlarmStatus(9);
    pub const UDF: AlarmStatus = AlarmStatus(17);

    pub fn from_code(code: i32) -> Self {
        AlarmStatus(u16::try_from(code).unwrap_or(u16::MAX))
    }

    pub fn name(self) -> &'static str {
        STATUS_NAMES
            .get(self.0 as usize)
            .copied()
            .unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match STATUS_NAMES.get(self.0 as usize) {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for AlarmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(index) = STATUS_NAMES.iter().position(|name| *name == s) {
            return Ok(AlarmStatus(index as u16));
        }
        s.parse::<u16>()
            .map(AlarmStatus)
            .map_err(|_| format!("unknown alarm status: {}", s))
    }
}

/// Sample value in one of the forms a PV can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    Double(f64),
    Integer(i64),
    Enumerated { index: u16, label: Option<String> },
    Text(String),
    Array(Vec<f64>),
}

impl SampleValue {
    /// Numeric view of the value; enumerations yield their index, arrays their
    /// first element.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Double(v) => Some(*v),
            SampleValue::Integer(v) => Some(*v as f64),
            SampleValue::Enumerated { index, .. } => Some(f64::from(*index)),
            SampleValue::Array(values) => values.first().copied(),
            SampleValue::Text(_) => None,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Double(v) => write!(f, "{}", v),
            SampleValue::Integer(v) => write!(f, "{}", v),
            SampleValue::Enumerated {
                label: Some(label), ..
            } => f.write_str(label),
            SampleValue::Enumerated { index, .. } => write!(f, "{}", index),
            SampleValue::Text(s) => f.write_str(s),
            SampleValue::Array(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PointKind {
    #[default]
    Sample,
    /// Synthetic boundary marking a recording dropout.
    GapMarker,
}

const INVALID_TEXT: &str = "<invalid>";
const GAP_TEXT: &str = "<gap>";

/// One historical sample. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    timestamp: DateTime<Utc>,
    value: Option<SampleValue>,
    severity: Severity,
    status: AlarmStatus,
    valid: bool,
    kind: PointKind,
}

impl DataPoint {
    /// Builds a sample from a raw (value, timestamp, severity, status) tuple.
    /// A sample at `Invalid` severity keeps its raw value but is not valid.
    pub fn new(
        value: SampleValue,
        timestamp: DateTime<Utc>,
        severity: Severity,
        status: AlarmStatus,
    ) -> Self {
        Self {
            timestamp,
            value: Some(value),
            severity,
            status,
            valid: severity != Severity::Invalid,
            kind: PointKind::Sample,
        }
    }

    /// A sample with no trustworthy value.
    pub fn invalid(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: None,
            severity: Severity::Invalid,
            status: AlarmStatus::UDF,
            valid: false,
            kind: PointKind::Sample,
        }
    }

    pub fn gap_marker(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: None,
            severity: Severity::Invalid,
            status: AlarmStatus::COMM,
            valid: false,
            kind: PointKind::GapMarker,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The value, or `None` when the point is invalid or a gap marker.
    pub fn value(&self) -> Option<&SampleValue> {
        if self.valid {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// The value as received, even when the point is flagged invalid.
    pub fn raw_value(&self) -> Option<&SampleValue> {
        self.value.as_ref()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value().and_then(SampleValue::as_f64)
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn status(&self) -> AlarmStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn kind(&self) -> PointKind {
        self.kind
    }

    pub fn is_gap_marker(&self) -> bool {
        self.kind == PointKind::GapMarker
    }

    /// Total order by timestamp; a real sample sorts before a marker at the
    /// same instant.
    pub fn cmp_by_time(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.kind.cmp(&other.kind))
    }

    /// Tab-separated export line: timestamp, value, severity, status.
    pub fn to_text_record(&self) -> String {
        let value = match (&self.kind, self.value()) {
            (PointKind::GapMarker, _) => GAP_TEXT.to_string(),
            (_, Some(value)) => value.to_string(),
            (_, None) => INVALID_TEXT.to_string(),
        };
        format!(
            "{}\t{}\t{}\t{}",
            format_timestamp(self.timestamp),
            value,
            self.severity,
            self.status
        )
    }

    /// Parses a line written by [`DataPoint::to_text_record`]. Any field that
    /// fails to parse yields an invalid point; an unreadable timestamp places
    /// that invalid point at the Unix epoch.
    pub fn from_text_record(line: &str) -> Self {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        let timestamp = match fields.first().map(|f| parse_timestamp(f)) {
            Some(Ok(ts)) => ts,
            _ => return Self::invalid(DateTime::<Utc>::default()),
        };
        if fields.len() != 4 {
            return Self::invalid(timestamp);
        }

        let (severity, status) = match (fields[2].parse::<Severity>(), fields[3].parse()) {
            (Ok(severity), Ok(status)) => (severity, status),
            _ => return Self::invalid(timestamp),
        };

        match fields[1].trim() {
            GAP_TEXT => Self::gap_marker(timestamp),
            INVALID_TEXT | "" => Self::invalid(timestamp),
            text => {
                let value = text
                    .parse::<f64>()
                    .map(SampleValue::Double)
                    .unwrap_or_else(|_| SampleValue::Text(text.to_string()));
                Self::new(value, timestamp, severity, status)
            }
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_record())
    }
}

/// Formats a timestamp as `dd/MMM/yyyy HH:mm:ss` (UTC).
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TEXT_TIMESTAMP_FORMAT).to_string()
}

/// Parses a `dd/MMM/yyyy HH:mm:ss` timestamp (UTC).
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text.trim(), TEXT_TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::NoAlarm < Severity::Minor);
        assert!(Severity::Minor < Severity::Major);
        assert!(Severity::Major < Severity::Invalid);
    }

    #[test]
    fn test_wire_severity_classification() {
        assert_eq!(WireSeverity::from_code(2), WireSeverity::Alarm(Severity::Major));
        assert_eq!(WireSeverity::from_code(3), WireSeverity::Alarm(Severity::Invalid));
        assert_eq!(WireSeverity::from_code(3904), WireSeverity::Dropout);
        assert_eq!(WireSeverity::from_code(3856), WireSeverity::Repeat);
    }

    #[test]
    fn test_timestamp_format_literal() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(format_timestamp(t), "05/Mar/2024 07:08:09");
    }

    #[test]
    fn test_timestamp_round_trip_to_second_resolution() {
        let t = Utc.timestamp_opt(1_710_287_585, 750_000_000).unwrap();
        let parsed = parse_timestamp(&format_timestamp(t)).unwrap();
        assert_eq!(parsed, t.with_nanosecond(0).unwrap());
    }

    #[test]
    fn test_invalid_point_is_not_zero() {
        let zero = DataPoint::new(SampleValue::Double(0.0), ts(10), Severity::NoAlarm, AlarmStatus::NO_ALARM);
        let invalid = DataPoint::invalid(ts(10));
        assert_eq!(zero.as_f64(), Some(0.0));
        assert_eq!(invalid.as_f64(), None);
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_invalid_severity_hides_value() {
        let point = DataPoint::new(SampleValue::Double(4.2), ts(1), Severity::Invalid, AlarmStatus::UDF);
        assert!(point.value().is_none());
        assert_eq!(point.raw_value(), Some(&SampleValue::Double(4.2)));
    }

    #[test]
    fn test_text_record_round_trip() {
        let point = DataPoint::new(SampleValue::Double(23.5), ts(1_710_287_585), Severity::Minor, AlarmStatus(4));
        let line = point.to_text_record();
        assert_eq!(line, "12/Mar/2024 23:53:05\t23.5\tMINOR\tHIGH");
        assert_eq!(DataPoint::from_text_record(&line), point);
    }

    #[test]
    fn test_unparsable_record_is_explicitly_invalid() {
        let bad_time = DataPoint::from_text_record("31/Foo/2024 00:00:00\t1.0\tNO_ALARM\tNO_ALARM");
        assert!(!bad_time.is_valid());
        assert_eq!(bad_time.timestamp(), DateTime::<Utc>::default());

        let bad_severity = DataPoint::from_text_record("12/Mar/2024 23:53:05\t1.0\tLOUD\tNO_ALARM");
        assert!(!bad_severity.is_valid());
        assert_eq!(bad_severity.timestamp(), ts(1_710_287_585));

        let truncated = DataPoint::from_text_record("12/Mar/2024 23:53:05\t1.0");
        assert!(truncated.value().is_none());
    }

    #[test]
    fn test_gap_marker_text() {
        let marker = DataPoint::gap_marker(ts(60));
        let parsed = DataPoint::from_text_record(&marker.to_text_record());
        assert!(parsed.is_gap_marker());
    }

    #[test]
    fn test_cmp_by_time_puts_sample_before_marker() {
        let sample = DataPoint::new(SampleValue::Integer(1), ts(5), Severity::NoAlarm, AlarmStatus::NO_ALARM);
        let marker = DataPoint::gap_marker(ts(5));
        assert_eq!(sample.cmp_by_time(&marker), Ordering::Less);
        assert_eq!(DataPoint::invalid(ts(4)).cmp_by_time(&sample), Ordering::Less);
    }

    #[test]
    fn test_enumerated_display_prefers_label() {
        let labelled = SampleValue::Enumerated { index: 1, label: Some("ON".into()) };
        let bare = SampleValue::Enumerated { index: 1, label: None };
        assert_eq!(labelled.to_string(), "ON");
        assert_eq!(bare.to_string(), "1");
        assert_eq!(labelled.as_f64(), Some(1.0));
    }
}
