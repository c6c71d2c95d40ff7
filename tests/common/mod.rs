#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusty_archive_access::archiver::error::{ArchiverError, Result};
use rusty_archive_access::archiver::types::{Meta, WirePoint, WireValue};
use rusty_archive_access::archiver::{
    ArchiveAccess, ArchiveConfig, ArchiverEndpoint, ArchiverTransport, MergePolicy, PvCoverage,
    PvDataResponse, SampleRequest,
};

pub const BASE: i64 = 1_700_000_000;

pub fn ts(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE + offset, 0).unwrap()
}

pub fn endpoint(name: &str) -> ArchiverEndpoint {
    ArchiverEndpoint::new(name, format!("http://{}.invalid/retrieval", name))
}

pub fn config(names: &[&str], policy: MergePolicy) -> ArchiveConfig {
    ArchiveConfig::default()
        .with_archivers(names.iter().map(|n| endpoint(n)).collect())
        .with_merge_policy(policy)
        .with_retry_backoff(Duration::from_millis(1))
}

#[derive(Default)]
struct Archive {
    pvs: BTreeMap<String, Vec<WirePoint>>,
    down: bool,
    discovery_down: bool,
    discovery_panics: bool,
    failing_fetches: u32,
    discovery_delay: Duration,
    fetch_delay: Duration,
    discovery_calls: usize,
    fetch_calls: usize,
}

/// In-memory archivers with scripted failures and delays. Counts requests
/// per archiver and the peak number of requests running at once.
#[derive(Default)]
pub struct FakeTransport {
    archives: Mutex<HashMap<String, Archive>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `pv` to `archiver` with `(offset_secs, value)` samples.
    pub fn add_pv(&self, archiver: &str, pv: &str, samples: &[(i64, f64)]) {
        let points = samples
            .iter()
            .map(|&(offset, value)| WirePoint {
                secs: BASE + offset,
                nanos: Some(0),
                val: WireValue::Double(value),
                severity: Some(0),
                status: Some(0),
            })
            .collect();
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .pvs
            .insert(pv.to_string(), points);
    }

    /// Every request to `archiver` fails with a transient error.
    pub fn set_down(&self, archiver: &str, down: bool) {
        self.archives.lock().entry(archiver.to_string()).or_default().down = down;
    }

    /// Only discovery fails; data requests still succeed.
    pub fn set_discovery_down(&self, archiver: &str, down: bool) {
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .discovery_down = down;
    }

    /// Discovery on `archiver` panics instead of answering.
    pub fn set_discovery_panic(&self, archiver: &str, panics: bool) {
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .discovery_panics = panics;
    }

    pub fn fail_next_fetches(&self, archiver: &str, count: u32) {
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .failing_fetches = count;
    }

    pub fn set_discovery_delay(&self, archiver: &str, delay: Duration) {
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .discovery_delay = delay;
    }

    pub fn set_fetch_delay(&self, archiver: &str, delay: Duration) {
        self.archives
            .lock()
            .entry(archiver.to_string())
            .or_default()
            .fetch_delay = delay;
    }

    pub fn discovery_calls(&self, archiver: &str) -> usize {
        self.archives
            .lock()
            .get(archiver)
            .map_or(0, |a| a.discovery_calls)
    }

    pub fn fetch_calls(&self, archiver: &str) -> usize {
        self.archives.lock().get(archiver).map_or(0, |a| a.fetch_calls)
    }

    pub fn total_fetch_calls(&self) -> usize {
        self.archives.lock().values().map(|a| a.fetch_calls).sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn occupy(&self, delay: Duration) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArchiverTransport for FakeTransport {
    async fn list_pvs(&self, archiver: &ArchiverEndpoint) -> Result<Vec<PvCoverage>> {
        let (delay, failing, panics) = {
            let mut archives = self.archives.lock();
            let archive = archives.entry(archiver.name.clone()).or_default();
            archive.discovery_calls += 1;
            (
                archive.discovery_delay,
                archive.down || archive.discovery_down,
                archive.discovery_panics,
            )
        };
        if panics {
            panic!("discovery on {} blew up", archiver.name);
        }
        self.occupy(delay).await;

        if failing {
            return Err(ArchiverError::transient(&archiver.id(), "connection refused"));
        }
        let archives = self.archives.lock();
        let names = archives
            .get(&archiver.name)
            .map(|a| a.pvs.keys().cloned().map(PvCoverage::named).collect())
            .unwrap_or_default();
        Ok(names)
    }

    async fn fetch_samples(
        &self,
        archiver: &ArchiverEndpoint,
        request: &SampleRequest,
    ) -> Result<PvDataResponse> {
        let (delay, failing) = {
            let mut archives = self.archives.lock();
            let archive = archives.entry(archiver.name.clone()).or_default();
            archive.fetch_calls += 1;
            let failing = archive.down || archive.failing_fetches > 0;
            archive.failing_fetches = archive.failing_fetches.saturating_sub(1);
            (archive.fetch_delay, failing)
        };
        self.occupy(delay).await;

        if failing {
            return Err(ArchiverError::transient(&archiver.id(), "503 service unavailable"));
        }
        let archives = self.archives.lock();
        let data = archives
            .get(&archiver.name)
            .and_then(|a| a.pvs.get(&request.pv))
            .cloned()
            .ok_or_else(|| ArchiverError::PvAbsent {
                archiver: archiver.id(),
                pv: request.pv.clone(),
            })?;
        Ok(PvDataResponse {
            meta: Meta {
                name: request.pv.clone(),
                ..Meta::default()
            },
            data,
        })
    }
}

pub fn access(transport: &Arc<FakeTransport>, config: ArchiveConfig) -> Arc<ArchiveAccess> {
    ArchiveAccess::init(config, transport.clone()).unwrap()
}
