//! Reconciles sequences for one PV returned by several archivers.
//!
//! The union of the sources' time spans is cut at every span boundary. Each
//! boundary instant and each open interval between adjacent boundaries is
//! taken from exactly one source, the one ranked highest among those whose
//! span includes it, so overlapping timestamps are never duplicated.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

use super::index::Candidate;
use super::point::DataPoint;
use super::sequence::DataPointSequence;
use super::types::ArchiverId;

/// Decides which source wins an overlapping sub-range. `Ordering::Greater`
/// means `a` is preferred over `b`.
pub trait SourceRanking: Send + Sync + fmt::Debug {
    fn compare(&self, a: &Candidate, b: &Candidate, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Ordering;
}

/// Default ranking: an archiver whose declared coverage encloses the
/// sub-range beats one that does not; otherwise the most recently refreshed
/// index entry wins; the smaller id settles exact ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageThenFreshness;

impl SourceRanking for CoverageThenFreshness {
    fn compare(&self, a: &Candidate, b: &Candidate, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Ordering {
        a.coverage
            .contains(lo, hi)
            .cmp(&b.coverage.contains(lo, hi))
            .then_with(|| freshness(a, b))
            .then_with(|| b.id.cmp(&a.id))
    }
}

/// Ignores declared coverage; the freshest index entry always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshestIndexWins;

impl SourceRanking for FreshestIndexWins {
    fn compare(&self, a: &Candidate, b: &Candidate, _lo: DateTime<Utc>, _hi: DateTime<Utc>) -> Ordering {
        freshness(a, b).then_with(|| b.id.cmp(&a.id))
    }
}

fn freshness(a: &Candidate, b: &Candidate) -> Ordering {
    (a.refreshed_at, a.generation).cmp(&(b.refreshed_at, b.generation))
}

/// One archiver's normalized answer.
#[derive(Debug, Clone)]
pub struct SourceData {
    pub candidate: Candidate,
    pub sequence: DataPointSequence,
}

/// Which archiver supplied each stretch of a merged result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub archiver: ArchiverId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub points: usize,
}

pub fn merge_sources(
    sources: Vec<SourceData>,
    ranking: &dyn SourceRanking,
) -> (DataPointSequence, Vec<Contribution>) {
    let spans: Vec<(usize, DateTime<Utc>, DateTime<Utc>)> = sources
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.sequence.span().map(|(first, last)| (i, first, last)))
        .collect();

    match spans.len() {
        0 => return (DataPointSequence::new(), Vec::new()),
        1 => {
            let (i, first, last) = spans[0];
            let source = &sources[i];
            let contribution = Contribution {
                archiver: source.candidate.id.clone(),
                start: first,
                end: last,
                points: source.sequence.len(),
            };
            return (source.sequence.clone(), vec![contribution]);
        }
        _ => {}
    }

    let mut boundaries: Vec<DateTime<Utc>> = spans.iter().flat_map(|&(_, f, l)| [f, l]).collect();
    boundaries.sort();
    boundaries.dedup();

    let mut merged = DataPointSequence::new();
    let mut contributions: Vec<Contribution> = Vec::new();

    for (n, &at) in boundaries.iter().enumerate() {
        // the instant itself goes to the best source whose span includes it
        let including = spans.iter().filter(|&&(_, f, l)| f <= at && at <= l);
        if let Some(i) = best(&sources, ranking, including, at, at) {
            let slice = sources[i].sequence.range(at, at);
            take(&mut merged, &mut contributions, &sources[i].candidate.id, at, at, slice);
        }

        // points strictly inside (at, next) belong to a source spanning both
        // ends, since no span ends between two adjacent boundaries
        let next = match boundaries.get(n + 1) {
            Some(&next) => next,
            None => break,
        };
        let covering = spans.iter().filter(|&&(_, f, l)| f <= at && l >= next);
        if let Some(i) = best(&sources, ranking, covering, at, next) {
            let slice = sources[i].sequence.range_exclusive(at, next);
            take(&mut merged, &mut contributions, &sources[i].candidate.id, at, next, slice);
        }
    }

    (merged, contributions)
}

fn best<'a, I>(
    sources: &[SourceData],
    ranking: &dyn SourceRanking,
    eligible: I,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> Option<usize>
where
    I: Iterator<Item = &'a (usize, DateTime<Utc>, DateTime<Utc>)>,
{
    eligible
        .map(|&(i, _, _)| i)
        .max_by(|&a, &b| ranking.compare(&sources[a].candidate, &sources[b].candidate, lo, hi))
}

fn take(
    merged: &mut DataPointSequence,
    contributions: &mut Vec<Contribution>,
    archiver: &ArchiverId,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
    slice: &[DataPoint],
) {
    if slice.is_empty() {
        return;
    }
    merged.extend(slice.iter().cloned());

    match contributions.last_mut() {
        Some(last) if last.archiver == *archiver => {
            last.end = hi;
            last.points += slice.len();
        }
        _ => contributions.push(Contribution {
            archiver: archiver.clone(),
            start: lo,
            end: hi,
            points: slice.len(),
        }),
    }
}
