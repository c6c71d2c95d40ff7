// export.rs

use std::fmt::Write;
use std::io;

use crate::archiver::error::Result;
use crate::archiver::point::{format_timestamp, DataPoint};
use crate::archiver::sequence::DataPointSequence;

const TEXT_COLUMNS: &str = "Timestamp\tValue\tSeverity\tStatus";
const STATISTICS_HEADER: &str = "Statistics:";

/// Exports a sequence as CSV, one row per point.
pub fn to_csv(pv: &str, sequence: &DataPointSequence) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["timestamp", "pv_name", "value", "severity", "status", "valid"])?;

    for point in sequence {
        let value = point
            .value()
            .map(|v| v.to_string())
            .unwrap_or_default();
        wtr.write_record([
            format_timestamp(point.timestamp()),
            pv.to_string(),
            value,
            point.severity().to_string(),
            point.status().to_string(),
            point.is_valid().to_string(),
        ])?;
    }

    let bytes = wtr.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}

/// Exports a sequence as tab-separated text that [`from_text`] reads back.
pub fn to_text(pv: &str, sequence: &DataPointSequence) -> Result<String> {
    let mut output = String::new();

    writeln!(output, "PV: {}", pv)?;
    writeln!(output, "Points: {}", sequence.len())?;
    writeln!(output, "\n{}", TEXT_COLUMNS)?;
    for point in sequence {
        writeln!(output, "{}", point.to_text_record())?;
    }

    if let Some(stats) = sequence.statistics() {
        writeln!(output, "\n{}", STATISTICS_HEADER)?;
        writeln!(output, "Mean: {:.6}", stats.mean)?;
        writeln!(output, "Standard Deviation: {:.6}", stats.std_dev)?;
        writeln!(output, "Minimum: {:.6}", stats.min)?;
        writeln!(output, "Maximum: {:.6}", stats.max)?;
        writeln!(output, "Count: {}", stats.count)?;
    }

    Ok(output)
}

/// Reads text written by [`to_text`]. Returns the PV name, if present, and
/// the points. Lines that do not parse become invalid points.
pub fn from_text(text: &str) -> (Option<String>, DataPointSequence) {
    let mut pv = None;
    let mut sequence = DataPointSequence::new();

    for line in text.lines() {
        if line.starts_with(STATISTICS_HEADER) {
            break;
        }
        if let Some(name) = line.strip_prefix("PV: ") {
            pv = Some(name.trim().to_string());
            continue;
        }
        if line.trim().is_empty() || line.starts_with("Points: ") || line == TEXT_COLUMNS {
            continue;
        }
        sequence.push(DataPoint::from_text_record(line));
    }

    (pv, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::point::{AlarmStatus, SampleValue, Severity};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn sample() -> DataPointSequence {
        let ts = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap();
        vec![
            DataPoint::new(SampleValue::Double(1.5), ts(0), Severity::NoAlarm, AlarmStatus::NO_ALARM),
            DataPoint::new(SampleValue::Double(2.5), ts(10), Severity::Minor, AlarmStatus::NO_ALARM),
            DataPoint::gap_marker(ts(20)),
            DataPoint::new(SampleValue::Double(4.0), ts(60), Severity::NoAlarm, AlarmStatus::NO_ALARM),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_csv_export() {
        let csv = to_csv("SR:CURRENT", &sample()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "timestamp,pv_name,value,severity,status,valid");
        assert!(lines[1].starts_with("14/Nov/2023 22:13:20,SR:CURRENT,1.5,"));
        assert!(lines[1].ends_with(",true"));
        assert!(lines[3].ends_with(",false"));
    }

    #[test]
    fn test_text_export_reads_back() {
        let original = sample();
        let text = to_text("SR:CURRENT", &original).unwrap();
        assert!(text.starts_with("PV: SR:CURRENT\n"));
        assert!(text.contains("Statistics:"));

        let (pv, parsed) = from_text(&text);
        assert_eq!(pv.as_deref(), Some("SR:CURRENT"));
        assert_eq!(parsed.len(), original.len());
        for (a, b) in original.iter().zip(parsed.iter()) {
            assert_eq!(a.timestamp(), b.timestamp());
            assert_eq!(a.is_valid(), b.is_valid());
            assert_eq!(a.is_gap_marker(), b.is_gap_marker());
            assert_eq!(a.as_f64(), b.as_f64());
        }
    }

    #[test]
    fn test_from_text_keeps_bad_lines_as_invalid() {
        let text = "PV: X\n\nTimestamp\tValue\tSeverity\tStatus\nnot a record\n";
        let (_, parsed) = from_text(text);
        assert_eq!(parsed.len(), 1);
        assert!(!parsed.first().unwrap().is_valid());
    }
}
