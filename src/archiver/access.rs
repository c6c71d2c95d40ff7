//! Entry point for archive retrieval.
//!
//! `ArchiveAccess` owns the index, the dispatcher and the shared worker
//! pool. Callers ask for a PV over a time range and get back one ordered
//! sequence; which archivers answered, and how, shows up in the result's
//! diagnostics and on the status bus.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::HttpTransport;
use super::config::ArchiveConfig;
use super::dispatcher::{
    DispatchSettings, PendingQuery, PendingQueryInfo, QueryDispatcher, QueryHandle, QueryResult,
};
use super::error::{ArchiverError, Result};
use super::health::{ArchiveEvent, StatusBus};
use super::index::{ArchiverIndex, ArchiverRecord, RefreshSummary};
use super::merge::{CoverageThenFreshness, SourceRanking};
use super::metrics::{DispatchMetrics, MetricsSnapshot};
use super::pool::WorkerPool;
use super::transport::ArchiverTransport;
use super::types::{ArchiverId, Coverage, RetrievalMode, SampleRequest};
use super::validation::Validator;

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<RefreshSummary, String>>>;

struct InFlightRefresh {
    round: u64,
    summary: SharedRefresh,
}

pub struct ArchiveAccess {
    config: ArchiveConfig,
    index: Arc<ArchiverIndex>,
    dispatcher: Arc<QueryDispatcher>,
    pool: WorkerPool,
    metrics: Arc<DispatchMetrics>,
    bus: StatusBus,
    refresh: Arc<Mutex<Option<InFlightRefresh>>>,
    rounds: AtomicU64,
    shut_down: AtomicBool,
}

impl ArchiveAccess {
    /// Builds the façade over `transport` with the default merge ranking.
    /// No network traffic happens until the first refresh or query.
    pub fn init(config: ArchiveConfig, transport: Arc<dyn ArchiverTransport>) -> Result<Arc<Self>> {
        Self::init_with_ranking(config, transport, Arc::new(CoverageThenFreshness))
    }

    pub fn init_with_ranking(
        config: ArchiveConfig,
        transport: Arc<dyn ArchiverTransport>,
        ranking: Arc<dyn SourceRanking>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = WorkerPool::new(config.max_concurrent_requests);
        let metrics = Arc::new(DispatchMetrics::new());
        let bus = StatusBus::default();
        let index = Arc::new(ArchiverIndex::new(
            transport.clone(),
            pool.clone(),
            metrics.clone(),
        ));
        index.register(&config.archivers);

        let dispatcher = Arc::new(QueryDispatcher::new(
            index.clone(),
            transport,
            pool.clone(),
            metrics.clone(),
            bus.clone(),
            DispatchSettings::from(&config),
            ranking,
        ));

        info!(
            archivers = config.archivers.len(),
            merge_policy = %config.merge_policy,
            retry_count = config.retry_count,
            pool = config.max_concurrent_requests,
            "archive access initialized"
        );

        Ok(Arc::new(Self {
            config,
            index,
            dispatcher,
            pool,
            metrics,
            bus,
            refresh: Arc::new(Mutex::new(None)),
            rounds: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Same as [`init`](Self::init) over HTTP.
    pub fn connect(config: ArchiveConfig) -> Result<Arc<Self>> {
        let transport = HttpTransport::new(&config)?;
        Self::init(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Re-runs discovery on every configured archiver. A call made while a
    /// round is already running joins that round instead of starting one.
    pub async fn refresh_index(&self) -> Result<RefreshSummary> {
        self.ensure_running()?;

        let (round, summary) = {
            let mut slot = self.refresh.lock().await;
            match slot.as_ref() {
                Some(inflight) => {
                    debug!(round = inflight.round, "joining index refresh in progress");
                    (inflight.round, inflight.summary.clone())
                }
                None => {
                    let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
                    let summary = self.spawn_refresh(round);
                    *slot = Some(InFlightRefresh {
                        round,
                        summary: summary.clone(),
                    });
                    (round, summary)
                }
            }
        };

        summary.await.map_err(|message| {
            warn!(round, error = %message, "index refresh aborted");
            ArchiverError::RefreshFailed(message)
        })
    }

    /// Discovery runs on its own task so that a caller going away does not
    /// strand the callers that joined it.
    fn spawn_refresh(&self, round: u64) -> SharedRefresh {
        let index = self.index.clone();
        let bus = self.bus.clone();
        let servers = self.config.archivers.clone();
        let slot = self.refresh.clone();

        let task = {
            let slot = slot.clone();
            tokio::spawn(async move {
                let summary = index.refresh(&servers).await;
                publish_refresh(&bus, &summary);
                release_round(&slot, round).await;
                summary
            })
        };

        async move {
            let outcome = task.await.map_err(|e| e.to_string());
            // A panicked round never reached its own release.
            release_round(&slot, round).await;
            outcome
        }
        .boxed()
        .shared()
    }

    /// Fetches raw samples for `pv` over `[start, end]`.
    pub async fn get_data(
        &self,
        pv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<QueryResult> {
        self.get_data_with(pv, start, end, RetrievalMode::Raw).await
    }

    pub async fn get_data_with(
        &self,
        pv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: RetrievalMode,
    ) -> Result<QueryResult> {
        let (pending, _handle) = self.start_query(pv, start, end, mode).await?;
        pending.await
    }

    /// Validates the request, builds the index if no refresh has completed
    /// yet, and registers the query. The returned future does the fetching;
    /// the handle cancels it.
    pub async fn start_query(
        &self,
        pv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: RetrievalMode,
    ) -> Result<(PendingQuery, QueryHandle)> {
        self.ensure_running()?;

        let pv = Validator::normalize_pv_name(pv);
        Validator::validate_pv_name(pv)?;
        Validator::validate_time_range(start, end)?;
        Validator::validate_mode(&mode)?;

        self.ensure_index().await?;
        // shutdown may have landed while discovery ran
        self.ensure_running()?;

        let request = SampleRequest {
            pv: pv.to_string(),
            start,
            end,
            mode,
        };
        Ok(self.dispatcher.dispatch(request))
    }

    pub fn cancel(&self, query: Uuid) -> bool {
        self.dispatcher.cancel(query)
    }

    pub fn in_flight(&self) -> Vec<PendingQueryInfo> {
        self.dispatcher.in_flight()
    }

    /// PV names across every archiver matching a regular expression.
    pub async fn matching_pv_names(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_running()?;
        let pattern: Regex = Validator::compile_pattern(pattern)?;
        self.ensure_index().await?;
        Ok(self.index.matching_pv_names(&pattern))
    }

    pub fn lookup(&self, pv: &str) -> BTreeSet<ArchiverId> {
        self.index.lookup(pv)
    }

    pub fn coverage(&self, pv: &str) -> BTreeMap<ArchiverId, Coverage> {
        self.index.coverage(pv)
    }

    pub fn pv_mapping(&self) -> BTreeMap<String, BTreeSet<ArchiverId>> {
        self.index.mapping()
    }

    pub fn archiver_status(&self) -> Vec<ArchiverRecord> {
        self.index.records()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.bus.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancels pending queries and closes the worker pool. Later calls fail
    /// with `ShutDown`. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.dispatcher.in_flight().len();
        self.dispatcher.cancel_all();
        self.pool.close();
        info!(pending, "archive access shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(ArchiverError::ShutDown);
        }
        Ok(())
    }

    async fn ensure_index(&self) -> Result<()> {
        if !self.index.is_built() {
            self.refresh_index().await?;
        }
        Ok(())
    }
}

impl Drop for ArchiveAccess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Empties the refresh slot if it still holds `round`.
async fn release_round(slot: &Mutex<Option<InFlightRefresh>>, round: u64) {
    let mut slot = slot.lock().await;
    if slot.as_ref().map(|inflight| inflight.round) == Some(round) {
        *slot = None;
    }
}

fn publish_refresh(bus: &StatusBus, summary: &RefreshSummary) {
    for transition in &summary.transitions {
        bus.publish(ArchiveEvent::ReachabilityChanged {
            archiver: transition.archiver.clone(),
            from: transition.from,
            to: transition.to,
            at: summary.completed_at,
        });
    }
    let failed = summary.failed();
    if !failed.is_empty() {
        bus.publish(ArchiveEvent::IndexStale { failed });
    }
    bus.publish(ArchiveEvent::IndexRefreshed {
        summary: summary.clone(),
    });
}
