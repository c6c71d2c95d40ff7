use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use super::error::{ArchiverError, Result};
use super::point::{AlarmStatus, DataPoint, SampleValue, Severity, WireSeverity};
use super::sequence::DataPointSequence;

/// Stable identity of a configured archiver.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiverId(String);

impl ArchiverId {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArchiverId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ArchiverId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One configured archive server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverEndpoint {
    pub name: String,
    /// Base retrieval URL, e.g. `http://archiver:17665/retrieval`.
    pub url: String,
}

impl ArchiverEndpoint {
    pub fn new<N: Into<String>, U: Into<String>>(name: N, url: U) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    pub fn id(&self) -> ArchiverId {
        ArchiverId::new(self.name.clone())
    }
}

/// Time window an archiver claims to hold for a PV. Either bound may be
/// unknown when the server does not report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl Coverage {
    pub fn new(first: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> Self {
        Self { first, last }
    }

    /// True only when both bounds are known and enclose `[lo, hi]`.
    pub fn contains(&self, lo: DateTime<Utc>, hi: DateTime<Utc>) -> bool {
        matches!((self.first, self.last), (Some(first), Some(last)) if first <= lo && last >= hi)
    }

    pub fn is_known(&self) -> bool {
        self.first.is_some() || self.last.is_some()
    }
}

/// One entry of a discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvCoverage {
    pub name: String,
    #[serde(default)]
    pub first: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last: Option<DateTime<Utc>>,
}

impl PvCoverage {
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            first: None,
            last: None,
        }
    }

    pub fn coverage(&self) -> Coverage {
        Coverage::new(self.first, self.last)
    }
}

/// Server-side processing applied to a query, expressed with the Archiver
/// Appliance operator syntax `op_N(pv)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    #[default]
    Raw,
    /// Let the server pick raw or binned data for roughly N points.
    Optimized(u32),
    /// Statistical operators over bins of N seconds.
    Mean(u32),
    Min(u32),
    Max(u32),
    FirstSample(u32),
    LastSample(u32),
}

impl RetrievalMode {
    pub fn operator(&self) -> Option<String> {
        match self {
            RetrievalMode::Raw => None,
            RetrievalMode::Optimized(points) => Some(format!("optimized_{}", points)),
            RetrievalMode::Mean(bin) => Some(format!("mean_{}", bin)),
            RetrievalMode::Min(bin) => Some(format!("min_{}", bin)),
            RetrievalMode::Max(bin) => Some(format!("max_{}", bin)),
            RetrievalMode::FirstSample(bin) => Some(format!("firstSample_{}", bin)),
            RetrievalMode::LastSample(bin) => Some(format!("lastSample_{}", bin)),
        }
    }

    /// PV name as sent on the wire, wrapped in the operator when one applies.
    pub fn format_pv(&self, pv: &str) -> String {
        match self.operator() {
            Some(op) => format!("{}({})", op, pv),
            None => pv.to_string(),
        }
    }

    pub fn is_binned(&self) -> bool {
        !matches!(self, RetrievalMode::Raw | RetrievalMode::Optimized(_))
    }
}

/// A query against one archiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub pv: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub mode: RetrievalMode,
}

impl SampleRequest {
    pub fn wire_pv(&self) -> String {
        self.mode.format_pv(&self.pv)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "EGU")]
    pub egu: Option<String>,
    #[serde(default, alias = "DESC")]
    pub description: Option<String>,
    #[serde(default, alias = "PREC", deserialize_with = "deserialize_string_or_int")]
    pub precision: Option<i32>,
    #[serde(default, alias = "HOPR", deserialize_with = "deserialize_string_or_float")]
    pub display_high: Option<f64>,
    #[serde(default, alias = "LOPR", deserialize_with = "deserialize_string_or_float")]
    pub display_low: Option<f64>,
    /// Enumeration state strings, when the PV is an enum.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl Meta {
    pub fn display_range(&self) -> Option<(f64, f64)> {
        match (self.display_low, self.display_high) {
            (Some(low), Some(high)) if high > low => Some((low, high)),
            _ if self.egu.as_deref() == Some("%") => Some((0.0, 100.0)),
            _ => None,
        }
    }
}

/// Raw sample as produced by `getData.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePoint {
    pub secs: i64,
    #[serde(default)]
    pub nanos: Option<i64>,
    pub val: WireValue,
    #[serde(default)]
    pub severity: Option<i32>,
    #[serde(default)]
    pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Integer(i64),
    Double(f64),
    Array(Vec<f64>),
    Text(String),
}

/// Samples for one PV from one archiver, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PvDataResponse {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub data: Vec<WirePoint>,
}

impl PvDataResponse {
    /// Normalizes wire samples into a sorted sequence clipped to
    /// `[start, end]`. Dropout severities become gap markers and
    /// repeat-count samples lose their pseudo status.
    pub fn into_sequence(
        self,
        archiver: &ArchiverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataPointSequence> {
        let labels = self.meta.labels.unwrap_or_default();
        let mut sequence = DataPointSequence::with_capacity(self.data.len());

        for point in self.data {
            let timestamp = wire_timestamp(point.secs, point.nanos.unwrap_or(0)).ok_or_else(|| {
                ArchiverError::malformed(
                    archiver,
                    format!("bad timestamp secs={} nanos={:?}", point.secs, point.nanos),
                )
            })?;
            if timestamp < start || timestamp > end {
                continue;
            }

            let (severity, status) = match WireSeverity::from_code(point.severity.unwrap_or(0)) {
                WireSeverity::Dropout => {
                    sequence.push(DataPoint::gap_marker(timestamp));
                    continue;
                }
                WireSeverity::Repeat => (Severity::NoAlarm, AlarmStatus::NO_ALARM),
                WireSeverity::Alarm(severity) => {
                    (severity, AlarmStatus::from_code(point.status.unwrap_or(0)))
                }
            };

            let value = match point.val {
                WireValue::Integer(index) if !labels.is_empty() => {
                    let label = usize::try_from(index).ok().and_then(|i| labels.get(i)).cloned();
                    SampleValue::Enumerated {
                        index: u16::try_from(index).unwrap_or(u16::MAX),
                        label,
                    }
                }
                WireValue::Integer(v) => SampleValue::Integer(v),
                WireValue::Double(v) => SampleValue::Double(v),
                WireValue::Array(values) => SampleValue::Array(values),
                WireValue::Text(text) => SampleValue::Text(text),
            };
            sequence.push(DataPoint::new(value, timestamp, severity, status));
        }
        Ok(sequence)
    }
}

fn wire_timestamp(secs: i64, nanos: i64) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(nanos).ok().filter(|n| *n < 1_000_000_000)?;
    Utc.timestamp_opt(secs, nanos).single()
}

// Archivers send numeric metadata either as numbers or as strings
fn deserialize_string_or_int<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => {
            // "2.0" style precision is truncated
            if let Ok(f) = s.parse::<f64>() {
                Ok(Some(f as i32))
            } else {
                s.parse().map(Some).map_err(D::Error::custom)
            }
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|n| Some(n as i32))
            .ok_or_else(|| D::Error::custom("Invalid number")),
        _ => Ok(None),
    }
}

fn deserialize_string_or_float<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => s.parse::<f64>().map(Some).map_err(D::Error::custom),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("Invalid number")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn archiver() -> ArchiverId {
        ArchiverId::from("arch-a")
    }

    #[test]
    fn test_retrieval_mode_operator_syntax() {
        assert_eq!(RetrievalMode::Raw.format_pv("SR:C01:CURRENT"), "SR:C01:CURRENT");
        assert_eq!(RetrievalMode::Mean(60).format_pv("SR:C01:CURRENT"), "mean_60(SR:C01:CURRENT)");
        assert_eq!(RetrievalMode::Optimized(1000).format_pv("X"), "optimized_1000(X)");
        assert_eq!(RetrievalMode::FirstSample(10).format_pv("X"), "firstSample_10(X)");
    }

    #[test]
    fn test_coverage_contains_requires_both_bounds() {
        let full = Coverage::new(Some(ts(0)), Some(ts(100)));
        assert!(full.contains(ts(10), ts(90)));
        assert!(!full.contains(ts(10), ts(110)));
        assert!(!Coverage::new(Some(ts(0)), None).contains(ts(10), ts(20)));
    }

    #[test]
    fn test_meta_accepts_string_precision() {
        let meta: Meta = serde_json::from_str(r#"{"name":"X","EGU":"mA","PREC":"3"}"#).unwrap();
        assert_eq!(meta.precision, Some(3));
        assert_eq!(meta.egu.as_deref(), Some("mA"));
        assert_eq!(meta.display_range(), None);
    }

    #[test]
    fn test_normalize_wire_payload() {
        let json = r#"{
            "meta": {"name": "TEST:PV1", "PREC": 2},
            "data": [
                {"secs": 30, "nanos": 0, "val": 3.5, "severity": 0, "status": 0},
                {"secs": 10, "nanos": 500, "val": 1.25, "severity": 1, "status": 4},
                {"secs": 20, "val": 2.0, "severity": 3904, "status": 0},
                {"secs": 40, "val": 4.0, "severity": 3856, "status": 7},
                {"secs": 90, "val": 9.0}
            ]
        }"#;
        let response: PvDataResponse = serde_json::from_str(json).unwrap();
        let seq = response.into_sequence(&archiver(), ts(0), ts(60)).unwrap();

        let points = seq.as_slice();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].severity(), Severity::Minor);
        assert_eq!(points[0].status().name(), "HIGH");
        assert_eq!(points[0].timestamp().timestamp_subsec_nanos(), 500);
        assert!(points[1].is_gap_marker());
        assert_eq!(points[2].as_f64(), Some(3.5));
        assert_eq!(points[3].status(), AlarmStatus::NO_ALARM);
    }

    #[test]
    fn test_enum_values_pick_up_labels() {
        let json = r#"{"meta": {"name": "X", "labels": ["OFF", "ON"]}, "data": [{"secs": 1, "val": 1}]}"#;
        let response: PvDataResponse = serde_json::from_str(json).unwrap();
        let seq = response.into_sequence(&archiver(), ts(0), ts(10)).unwrap();
        assert_eq!(
            seq.first().and_then(|p| p.value()).cloned(),
            Some(SampleValue::Enumerated { index: 1, label: Some("ON".to_string()) })
        );
    }

    #[test]
    fn test_bad_nanos_are_malformed() {
        let response = PvDataResponse {
            meta: Meta::default(),
            data: vec![WirePoint {
                secs: 1,
                nanos: Some(-5),
                val: WireValue::Double(1.0),
                severity: None,
                status: None,
            }],
        };
        let err = response.into_sequence(&archiver(), ts(0), ts(10)).unwrap_err();
        assert!(matches!(err, ArchiverError::Malformed { .. }));
        assert!(!err.is_retryable());
    }
}
