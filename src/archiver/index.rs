//! Per-archiver catalog of PV names.
//!
//! Each archiver owns a slot holding an `Arc` snapshot of its PV set.
//! Refresh builds a new snapshot off to the side and swaps it in under a
//! short write lock, so readers see either the old set or the new one for
//! any given archiver, never a mix.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::error::Result;
use super::health::Reachability;
use super::metrics::DispatchMetrics;
use super::pool::WorkerPool;
use super::transport::ArchiverTransport;
use super::types::{ArchiverEndpoint, ArchiverId, Coverage, PvCoverage};
use super::validation::Validator;

#[derive(Debug, Default)]
struct PvSnapshot {
    names: HashMap<String, Coverage>,
    refreshed_at: Option<DateTime<Utc>>,
    generation: u64,
}

#[derive(Debug, Default, Clone)]
struct SlotState {
    reachability: Reachability,
    last_error: Option<String>,
    last_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ArchiverSlot {
    endpoint: ArchiverEndpoint,
    snapshot: RwLock<Arc<PvSnapshot>>,
    state: RwLock<SlotState>,
}

impl ArchiverSlot {
    fn new(endpoint: ArchiverEndpoint) -> Self {
        Self {
            endpoint,
            snapshot: RwLock::new(Arc::new(PvSnapshot::default())),
            state: RwLock::new(SlotState::default()),
        }
    }

    fn snapshot(&self) -> Arc<PvSnapshot> {
        self.snapshot.read().clone()
    }
}

/// Public view of one archiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverRecord {
    pub id: ArchiverId,
    pub url: String,
    pub reachability: Reachability,
    pub pv_count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// An archiver believed to hold a PV, with what the index knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: ArchiverId,
    pub endpoint: ArchiverEndpoint,
    pub coverage: Coverage,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Monotonic across the whole index; a larger value was swapped in later.
    pub generation: u64,
    pub reachability: Reachability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed { pv_count: usize },
    Failed { message: String, retained_pv_count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerRefresh {
    pub archiver: ArchiverId,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReachabilityTransition {
    pub archiver: ArchiverId,
    pub from: Reachability,
    pub to: Reachability,
}

/// Result of one refresh round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub servers: Vec<ServerRefresh>,
    pub transitions: Vec<ReachabilityTransition>,
}

impl RefreshSummary {
    /// Archivers whose discovery failed this round and now serve a stale set.
    pub fn failed(&self) -> Vec<ArchiverId> {
        self.servers
            .iter()
            .filter(|s| matches!(s.outcome, RefreshOutcome::Failed { .. }))
            .map(|s| s.archiver.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.servers
            .iter()
            .all(|s| matches!(s.outcome, RefreshOutcome::Refreshed { .. }))
    }

    pub fn refreshed_count(&self) -> usize {
        self.servers.len() - self.failed().len()
    }
}

pub struct ArchiverIndex {
    slots: DashMap<ArchiverId, Arc<ArchiverSlot>>,
    transport: Arc<dyn ArchiverTransport>,
    pool: WorkerPool,
    metrics: Arc<DispatchMetrics>,
    built: AtomicBool,
    generation: AtomicU64,
}

impl ArchiverIndex {
    pub fn new(
        transport: Arc<dyn ArchiverTransport>,
        pool: WorkerPool,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            transport,
            pool,
            metrics,
            built: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// True once at least one refresh round has completed.
    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    /// Creates slots for archivers not yet known, in the `Unknown` state.
    pub fn register(&self, servers: &[ArchiverEndpoint]) {
        for server in servers {
            self.slot_for(server);
        }
    }

    /// Queries every server concurrently through the worker pool. A failed
    /// server is marked unreachable and keeps its last-known PV set.
    pub async fn refresh(&self, servers: &[ArchiverEndpoint]) -> RefreshSummary {
        let started_at = Utc::now();
        self.metrics.record_discovery_round();

        let slots: Vec<Arc<ArchiverSlot>> = servers.iter().map(|s| self.slot_for(s)).collect();

        let mut pending: FuturesUnordered<_> = slots
            .into_iter()
            .map(|slot| async move {
                let began = Instant::now();
                self.metrics.record_request();
                let result = self
                    .pool
                    .run(self.transport.list_pvs(&slot.endpoint))
                    .await;
                self.metrics.record_latency(began.elapsed());
                (slot, result)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(servers.len());
        let mut transitions = Vec::new();
        while let Some((slot, result)) = pending.next().await {
            let (outcome, transition) = self.apply(&slot, result);
            outcomes.push(outcome);
            transitions.extend(transition);
        }
        outcomes.sort_by(|a, b| a.archiver.cmp(&b.archiver));

        self.built.store(true, Ordering::Release);
        let summary = RefreshSummary {
            started_at,
            completed_at: Utc::now(),
            servers: outcomes,
            transitions,
        };
        info!(
            servers = summary.servers.len(),
            refreshed = summary.refreshed_count(),
            "index refresh complete"
        );
        summary
    }

    fn slot_for(&self, endpoint: &ArchiverEndpoint) -> Arc<ArchiverSlot> {
        let id = endpoint.id();
        let mut entry = self
            .slots
            .entry(id)
            .or_insert_with(|| Arc::new(ArchiverSlot::new(endpoint.clone())));
        if entry.endpoint.url != endpoint.url {
            // moved server: start a fresh slot rather than trust the old set
            *entry = Arc::new(ArchiverSlot::new(endpoint.clone()));
        }
        entry.clone()
    }

    fn apply(
        &self,
        slot: &ArchiverSlot,
        result: Result<Vec<PvCoverage>>,
    ) -> (ServerRefresh, Option<ReachabilityTransition>) {
        let id = slot.endpoint.id();
        let now = Utc::now();

        let (outcome, reachability, error) = match result {
            Ok(list) => {
                let names: HashMap<String, Coverage> = list
                    .iter()
                    .map(|entry| {
                        (
                            Validator::normalize_pv_name(&entry.name).to_string(),
                            entry.coverage(),
                        )
                    })
                    .collect();
                let pv_count = names.len();
                let snapshot = Arc::new(PvSnapshot {
                    names,
                    refreshed_at: Some(now),
                    generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
                });
                *slot.snapshot.write() = snapshot;
                debug!(archiver = %id, pv_count, "archiver PV set replaced");
                (RefreshOutcome::Refreshed { pv_count }, Reachability::Reachable, None)
            }
            Err(e) => {
                let message = e.to_string();
                self.metrics.record_error(message.clone());
                let retained_pv_count = slot.snapshot().names.len();
                warn!(archiver = %id, error = %message, retained_pv_count, "discovery failed, keeping last-known PV set");
                (
                    RefreshOutcome::Failed {
                        message: message.clone(),
                        retained_pv_count,
                    },
                    Reachability::Unreachable,
                    Some(message),
                )
            }
        };

        let previous = {
            let mut state = slot.state.write();
            let previous = state.reachability;
            state.reachability = reachability;
            state.last_attempt = Some(now);
            if error.is_some() {
                state.last_error = error;
            }
            previous
        };

        let transition = (previous != reachability).then(|| ReachabilityTransition {
            archiver: id.clone(),
            from: previous,
            to: reachability,
        });
        (ServerRefresh { archiver: id, outcome }, transition)
    }

    /// Archivers currently believed to hold `pv`. Unknown PVs give an empty set.
    pub fn lookup(&self, pv: &str) -> BTreeSet<ArchiverId> {
        let pv = Validator::normalize_pv_name(pv);
        self.slots
            .iter()
            .filter(|slot| slot.snapshot().names.contains_key(pv))
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn candidates(&self, pv: &str) -> Vec<Candidate> {
        let pv = Validator::normalize_pv_name(pv);
        let mut candidates: Vec<Candidate> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let snapshot = slot.snapshot();
                let coverage = *snapshot.names.get(pv)?;
                Some(Candidate {
                    id: slot.key().clone(),
                    endpoint: slot.endpoint.clone(),
                    coverage,
                    refreshed_at: snapshot.refreshed_at,
                    generation: snapshot.generation,
                    reachability: slot.state.read().reachability,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    pub fn coverage(&self, pv: &str) -> BTreeMap<ArchiverId, Coverage> {
        self.candidates(pv)
            .into_iter()
            .map(|c| (c.id, c.coverage))
            .collect()
    }

    /// Every indexed PV name matching `pattern`, sorted and de-duplicated.
    pub fn matching_pv_names(&self, pattern: &Regex) -> Vec<String> {
        let mut names = BTreeSet::new();
        for slot in self.slots.iter() {
            let snapshot = slot.snapshot();
            names.extend(
                snapshot
                    .names
                    .keys()
                    .filter(|name| pattern.is_match(name))
                    .cloned(),
            );
        }
        names.into_iter().collect()
    }

    /// Full PV-to-archiver relation.
    pub fn mapping(&self) -> BTreeMap<String, BTreeSet<ArchiverId>> {
        let mut mapping: BTreeMap<String, BTreeSet<ArchiverId>> = BTreeMap::new();
        for slot in self.slots.iter() {
            for name in slot.snapshot().names.keys() {
                mapping
                    .entry(name.clone())
                    .or_default()
                    .insert(slot.key().clone());
            }
        }
        mapping
    }

    pub fn records(&self) -> Vec<ArchiverRecord> {
        let mut records: Vec<ArchiverRecord> = self
            .slots
            .iter()
            .map(|slot| {
                let snapshot = slot.snapshot();
                let state = slot.state.read().clone();
                ArchiverRecord {
                    id: slot.key().clone(),
                    url: slot.endpoint.url.clone(),
                    reachability: state.reachability,
                    pv_count: snapshot.names.len(),
                    last_refresh: snapshot.refreshed_at,
                    last_attempt: state.last_attempt,
                    last_error: state.last_error,
                }
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn reachability(&self, archiver: &ArchiverId) -> Option<Reachability> {
        self.slots
            .get(archiver)
            .map(|slot| slot.state.read().reachability)
    }
}
