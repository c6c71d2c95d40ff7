//! Concurrent multi-archiver queries.
//!
//! A query resolves its candidate archivers through the index, fans out one
//! task per candidate (each request holding a worker-pool permit), retries
//! transient failures per source, and either takes the first success or
//! merges every success. A `PendingQuery` future delivers the result;
//! its `QueryHandle` cancels delivery.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use pin_project::{pin_project, pinned_drop};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::config::{ArchiveConfig, MergePolicy};
use super::error::{ArchiverError, Result, SourceFailure};
use super::health::{ArchiveEvent, Reachability, StatusBus};
use super::index::{ArchiverIndex, Candidate};
use super::merge::{merge_sources, Contribution, SourceData, SourceRanking};
use super::metrics::DispatchMetrics;
use super::pool::WorkerPool;
use super::sequence::DataPointSequence;
use super::transport::ArchiverTransport;
use super::types::{ArchiverId, SampleRequest};
use crate::constants::MAX_RETRY_BACKOFF;

/// Non-fatal annotations attached to a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Some candidate archivers failed; the data comes from the rest.
    PartialCoverage { failed: Vec<SourceFailure> },
    /// These candidates were unreachable at their last discovery, so the
    /// index entry that selected them may be out of date.
    StaleIndex { archivers: Vec<ArchiverId> },
    GapsMarked { count: usize },
}

impl Diagnostic {
    /// True when the result may be missing data.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Diagnostic::PartialCoverage { .. } | Diagnostic::StaleIndex { .. })
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub pv: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sequence: DataPointSequence,
    pub diagnostics: Vec<Diagnostic>,
    pub sources: Vec<Contribution>,
}

impl QueryResult {
    pub fn is_complete(&self) -> bool {
        !self.diagnostics.iter().any(Diagnostic::is_degraded)
    }

    pub fn failed_sources(&self) -> Vec<&SourceFailure> {
        self.diagnostics
            .iter()
            .filter_map(|d| match d {
                Diagnostic::PartialCoverage { failed } => Some(failed.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Query-time policy taken from [`ArchiveConfig`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub merge_policy: MergePolicy,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub gap_threshold: Option<Duration>,
}

impl From<&ArchiveConfig> for DispatchSettings {
    fn from(config: &ArchiveConfig) -> Self {
        Self {
            merge_policy: config.merge_policy,
            retry_count: config.retry_count,
            retry_backoff: config.retry_backoff,
            gap_threshold: config.gap_threshold,
        }
    }
}

/// Bookkeeping for one in-flight query.
#[derive(Debug, Clone, Serialize)]
pub struct PendingQueryInfo {
    pub id: Uuid,
    pub pv: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub candidates: Vec<ArchiverId>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingEntry {
    info: PendingQueryInfo,
    abort: AbortHandle,
}

type Registry = Arc<DashMap<Uuid, PendingEntry>>;

/// Cancels a query. Requests already on the wire may complete; their
/// results are discarded.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    id: Uuid,
    abort: AbortHandle,
}

impl QueryHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Resolves to the query's result, or `Cancelled` once its handle fires.
/// Dropping it also releases the pending query.
#[pin_project(PinnedDrop)]
pub struct PendingQuery {
    id: Uuid,
    #[pin]
    inner: Abortable<BoxFuture<'static, Result<QueryResult>>>,
    registry: Registry,
    metrics: Arc<DispatchMetrics>,
}

impl PendingQuery {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingQuery {
    type Output = Result<QueryResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let outcome = futures::ready!(this.inner.poll(cx));
        this.registry.remove(&*this.id);
        match outcome {
            Ok(result) => Poll::Ready(result),
            Err(Aborted) => {
                this.metrics.record_cancelled();
                debug!(query = %this.id, "query cancelled");
                Poll::Ready(Err(ArchiverError::Cancelled(*this.id)))
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for PendingQuery {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.registry.remove(&*this.id);
    }
}

pub struct QueryDispatcher {
    index: Arc<ArchiverIndex>,
    transport: Arc<dyn ArchiverTransport>,
    pool: WorkerPool,
    metrics: Arc<DispatchMetrics>,
    bus: StatusBus,
    settings: DispatchSettings,
    ranking: Arc<dyn SourceRanking>,
    pending: Registry,
}

impl QueryDispatcher {
    pub fn new(
        index: Arc<ArchiverIndex>,
        transport: Arc<dyn ArchiverTransport>,
        pool: WorkerPool,
        metrics: Arc<DispatchMetrics>,
        bus: StatusBus,
        settings: DispatchSettings,
        ranking: Arc<dyn SourceRanking>,
    ) -> Self {
        Self {
            index,
            transport,
            pool,
            metrics,
            bus,
            settings,
            ranking,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Registers a pending query and returns its result future and handle.
    /// Nothing runs until the future is polled.
    pub fn dispatch(self: &Arc<Self>, request: SampleRequest) -> (PendingQuery, QueryHandle) {
        let id = Uuid::new_v4();
        let (abort, registration) = AbortHandle::new_pair();

        self.pending.insert(
            id,
            PendingEntry {
                info: PendingQueryInfo {
                    id,
                    pv: request.pv.clone(),
                    start: request.start,
                    end: request.end,
                    candidates: Vec::new(),
                    issued_at: Utc::now(),
                },
                abort: abort.clone(),
            },
        );

        let this = Arc::clone(self);
        let work = async move { this.execute(id, request).await }.boxed();

        let pending = PendingQuery {
            id,
            inner: Abortable::new(work, registration),
            registry: self.pending.clone(),
            metrics: self.metrics.clone(),
        };
        (pending, QueryHandle { id, abort })
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        match self.pending.get(&id) {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.pending.iter() {
            entry.abort.abort();
        }
    }

    pub fn in_flight(&self) -> Vec<PendingQueryInfo> {
        let mut queries: Vec<_> = self.pending.iter().map(|e| e.info.clone()).collect();
        queries.sort_by_key(|q| q.issued_at);
        queries
    }

    async fn execute(self: Arc<Self>, id: Uuid, request: SampleRequest) -> Result<QueryResult> {
        self.metrics.record_query();

        let candidates = self.index.candidates(&request.pv);
        if candidates.is_empty() {
            self.metrics.record_query_failure();
            debug!(pv = %request.pv, "no archiver holds PV");
            return Err(ArchiverError::NotFound { pv: request.pv });
        }
        if let Some(mut entry) = self.pending.get_mut(&id) {
            entry.info.candidates = candidates.iter().map(|c| c.id.clone()).collect();
        }

        let stale: Vec<ArchiverId> = candidates
            .iter()
            .filter(|c| c.reachability == Reachability::Unreachable)
            .map(|c| c.id.clone())
            .collect();

        let mut abandon = AbandonOnDrop(Vec::with_capacity(candidates.len()));
        let mut tasks: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|candidate| {
                let archiver = candidate.id.clone();
                let this = Arc::clone(&self);
                let request = request.clone();
                let (abort, registration) = AbortHandle::new_pair();
                abandon.0.push(abort);
                let work = async move {
                    let outcome = this.fetch_with_retry(&candidate, &request).await;
                    (candidate, outcome)
                };
                let handle = tokio::spawn(Abortable::new(work, registration));
                async move { (archiver, handle.await) }
            })
            .collect();

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        while let Some((archiver, joined)) = tasks.next().await {
            match joined {
                Ok(Ok((candidate, Ok(sequence)))) => {
                    successes.push(SourceData { candidate, sequence });
                    if self.settings.merge_policy == MergePolicy::FirstSuccess {
                        break;
                    }
                }
                Ok(Ok((_, Err(failure)))) => failures.push(failure),
                Ok(Err(Aborted)) => failures.push(SourceFailure {
                    archiver,
                    attempts: 0,
                    retryable: false,
                    message: "fetch abandoned".to_string(),
                }),
                Err(e) => failures.push(SourceFailure {
                    archiver,
                    attempts: 0,
                    retryable: false,
                    message: format!("fetch task failed: {}", e),
                }),
            }
        }
        // Sources still running are stopped; nothing waits for them.
        drop(tasks);
        drop(abandon);

        if successes.is_empty() {
            self.metrics.record_query_failure();
            if self.pool.is_closed() {
                return Err(ArchiverError::ShutDown);
            }
            let err = ArchiverError::TotalFailure {
                pv: request.pv.clone(),
                failures,
            };
            error!(pv = %request.pv, error = %err, "every candidate archiver failed");
            self.bus.publish(ArchiveEvent::QueryFailed {
                pv: request.pv,
                message: err.to_string(),
            });
            return Err(err);
        }

        let (mut sequence, sources) = merge_sources(successes, self.ranking.as_ref());

        let mut diagnostics = Vec::new();
        if !failures.is_empty() {
            self.metrics.record_partial();
            warn!(pv = %request.pv, failed = failures.len(), "partial archive coverage");
            self.bus.publish(ArchiveEvent::PartialCoverage {
                pv: request.pv.clone(),
                failed: failures.clone(),
            });
            diagnostics.push(Diagnostic::PartialCoverage { failed: failures });
        }
        if !stale.is_empty() {
            diagnostics.push(Diagnostic::StaleIndex { archivers: stale });
        }
        if let Some(threshold) = self.settings.gap_threshold {
            let count = sequence.insert_gap_markers(threshold);
            if count > 0 {
                diagnostics.push(Diagnostic::GapsMarked { count });
            }
        }

        debug!(pv = %request.pv, points = sequence.len(), sources = sources.len(), "query complete");
        Ok(QueryResult {
            query_id: id,
            pv: request.pv,
            start: request.start,
            end: request.end,
            sequence,
            diagnostics,
            sources,
        })
    }

    /// Fetches from one archiver, retrying transient failures up to
    /// `retry_count` times. The pool permit is released between attempts.
    /// Runs until done unless its query abandons it.
    async fn fetch_with_retry(
        &self,
        candidate: &Candidate,
        request: &SampleRequest,
    ) -> std::result::Result<DataPointSequence, SourceFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let began = Instant::now();
            self.metrics.record_request();

            let result = self
                .pool
                .run(async {
                    let response = self
                        .transport
                        .fetch_samples(&candidate.endpoint, request)
                        .await?;
                    response.into_sequence(&candidate.id, request.start, request.end)
                })
                .await;
            self.metrics.record_latency(began.elapsed());

            match result {
                Ok(sequence) => {
                    debug!(archiver = %candidate.id, pv = %request.pv, attempt, points = sequence.len(), "archiver answered");
                    return Ok(sequence);
                }
                Err(e) => {
                    self.metrics.record_error(e.to_string());
                    if e.is_retryable() && attempt <= self.settings.retry_count {
                        let delay =
                            retry_delay(e.retry_after(), self.settings.retry_backoff, attempt);
                        self.metrics.record_retry();
                        debug!(archiver = %candidate.id, pv = %request.pv, attempt, ?delay, error = %e, "retrying archiver request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(archiver = %candidate.id, pv = %request.pv, attempt, error = %e, "archiver request failed");
                    return Err(e.into_source_failure(&candidate.id, attempt));
                }
            }
        }
    }
}

/// Delay before retrying after failed attempt number `attempt`: the
/// server's `Retry-After` when it sent one, otherwise `base * 2^(attempt-1)`.
/// Capped at `MAX_RETRY_BACKOFF` either way.
fn retry_delay(retry_after: Option<Duration>, base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    retry_after
        .unwrap_or_else(|| base.saturating_mul(factor))
        .min(MAX_RETRY_BACKOFF)
}

/// Stops per-source tasks when the query stops waiting for them, whether it
/// finished early or was itself cancelled.
struct AbandonOnDrop(Vec<AbortHandle>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        for abort in &self.0 {
            abort.abort();
        }
    }
}
