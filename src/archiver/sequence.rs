//! Time-ordered container of [`DataPoint`]s for one PV over one query range.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::point::DataPoint;

/// Interval between two consecutive real samples that exceeds the expected
/// sampling period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

/// Sorted sequence of samples. Timestamps never decrease and gap markers
/// never share a timestamp with a real sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPointSequence {
    points: Vec<DataPoint>,
}

impl DataPointSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Inserts a point at its sorted position. Returns false when the point
    /// was dropped: a gap marker landing on an existing real sample. A real
    /// sample landing on a gap marker replaces the marker.
    pub fn push(&mut self, point: DataPoint) -> bool {
        let ts = point.timestamp();
        let same_instant = self.instant_bounds(ts);

        if point.is_gap_marker() {
            if self.points[same_instant].iter().any(|p| !p.is_gap_marker()) {
                return false;
            }
        } else {
            let (mut idx, mut end) = (same_instant.start, same_instant.end);
            while idx < end {
                if self.points[idx].is_gap_marker() {
                    self.points.remove(idx);
                    end -= 1;
                } else {
                    idx += 1;
                }
            }
        }

        // equal timestamps keep arrival order
        let at = self.points.partition_point(|p| p.timestamp() <= ts);
        if at == self.points.len() {
            self.points.push(point);
        } else {
            self.points.insert(at, point);
        }
        true
    }

    pub fn extend<I: IntoIterator<Item = DataPoint>>(&mut self, points: I) {
        for point in points {
            self.push(point);
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&DataPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&DataPoint> {
        self.points.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataPoint> {
        self.points.iter()
    }

    pub fn as_slice(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<DataPoint> {
        self.points
    }

    /// Timestamps of the first and last point.
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => Some((first.timestamp(), last.timestamp())),
            _ => None,
        }
    }

    /// Points with `start <= t <= end`, borrowed.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[DataPoint] {
        if end < start {
            return &[];
        }
        let lo = self.points.partition_point(|p| p.timestamp() < start);
        let hi = self.points.partition_point(|p| p.timestamp() <= end);
        &self.points[lo..hi]
    }

    /// Points with `start < t < end`, borrowed.
    pub fn range_exclusive(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[DataPoint] {
        if end <= start {
            return &[];
        }
        let lo = self.points.partition_point(|p| p.timestamp() <= start);
        let hi = self.points.partition_point(|p| p.timestamp() < end);
        &self.points[lo..hi]
    }

    /// Intervals between consecutive real samples longer than `threshold`
    /// that do not already contain a gap marker.
    pub fn detect_gaps(&self, threshold: Duration) -> Vec<Gap> {
        let threshold = to_chrono(threshold);
        let mut gaps = Vec::new();
        let mut previous: Option<&DataPoint> = None;
        let mut marked = false;

        for point in &self.points {
            if point.is_gap_marker() {
                marked = true;
                continue;
            }
            if let Some(prev) = previous {
                if !marked && point.timestamp() - prev.timestamp() > threshold {
                    gaps.push(Gap {
                        start: prev.timestamp(),
                        end: point.timestamp(),
                    });
                }
            }
            previous = Some(point);
            marked = false;
        }
        gaps
    }

    /// Inserts a gap marker one sampling period after the last sample before
    /// each detected gap. Returns the number of markers inserted.
    pub fn insert_gap_markers(&mut self, threshold: Duration) -> usize {
        let gaps = self.detect_gaps(threshold);
        let period = to_chrono(threshold);
        let mut inserted = 0;
        for gap in gaps {
            // gap.end - gap.start > period, so the marker falls strictly inside
            if self.push(DataPoint::gap_marker(gap.start + period)) {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn with_gap_markers(mut self, threshold: Duration) -> Self {
        self.insert_gap_markers(threshold);
        self
    }

    /// Summary over valid numeric samples.
    pub fn statistics(&self) -> Option<Statistics> {
        let samples: Vec<(DateTime<Utc>, f64)> = self
            .points
            .iter()
            .filter_map(|p| p.as_f64().map(|v| (p.timestamp(), v)))
            .collect();
        let (first, last) = (samples.first()?, samples.last()?);

        let count = samples.len();
        let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / count as f64;
        let variance = samples.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| {
                (lo.min(*v), hi.max(*v))
            });

        Some(Statistics {
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
            count,
            first_timestamp: first.0,
            last_timestamp: last.0,
        })
    }

    fn instant_bounds(&self, ts: DateTime<Utc>) -> std::ops::Range<usize> {
        let lo = self.points.partition_point(|p| p.timestamp() < ts);
        let hi = self.points.partition_point(|p| p.timestamp() <= ts);
        lo..hi
    }
}

impl FromIterator<DataPoint> for DataPointSequence {
    fn from_iter<I: IntoIterator<Item = DataPoint>>(iter: I) -> Self {
        let mut sequence = Self::new();
        sequence.extend(iter);
        sequence
    }
}

impl IntoIterator for DataPointSequence {
    type Item = DataPoint;
    type IntoIter = std::vec::IntoIter<DataPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

impl<'a> IntoIterator for &'a DataPointSequence {
    type Item = &'a DataPoint;
    type IntoIter = std::slice::Iter<'a, DataPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365 * 1000))
}
