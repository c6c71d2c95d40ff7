// metrics.rs

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::constants::{LATENCY_WINDOW, MAX_LATENCY_SAMPLES};

/// Counters for the dispatcher and index, shared across tasks.
#[derive(Debug)]
pub struct DispatchMetrics {
    // Request metrics
    requests_total: AtomicU64,
    failed_requests: AtomicU64,
    retries: AtomicU64,

    // Query outcomes
    queries_total: AtomicU64,
    partial_queries: AtomicU64,
    failed_queries: AtomicU64,
    cancelled_queries: AtomicU64,

    discovery_rounds: AtomicU64,

    start_time: Instant,
    last_error: RwLock<Option<(String, Instant)>>,
    latency_window: RwLock<TimeWindow<f64>>,
}

#[derive(Debug)]
struct TimeWindow<T> {
    data: VecDeque<(Instant, T)>,
    window_size: Duration,
    max_len: usize,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            queries_total: AtomicU64::new(0),
            partial_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            cancelled_queries: AtomicU64::new(0),
            discovery_rounds: AtomicU64::new(0),
            start_time: Instant::now(),
            last_error: RwLock::new(None),
            latency_window: RwLock::new(TimeWindow::new(LATENCY_WINDOW, MAX_LATENCY_SAMPLES)),
        }
    }

    /// One network request issued to an archiver (discovery or data).
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error_msg: String) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some((error_msg, Instant::now()));
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, duration: Duration) {
        self.latency_window
            .write()
            .add(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_query(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial(&self) {
        self.partial_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_failure(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_round(&self) {
        self.discovery_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn discovery_rounds(&self) -> u64 {
        self.discovery_rounds.load(Ordering::Relaxed)
    }

    fn calculate_percentile(sorted: &[f64], percentile: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((sorted.len() - 1) as f64 * percentile).round() as usize;
        sorted[index]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut latencies = self.latency_window.write().values();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let total = self.requests_total.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let average_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let last_error = self.last_error.read().clone();

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            total_requests: total,
            failed_requests: failed,
            retries: self.retries.load(Ordering::Relaxed),
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            total_queries: self.queries_total.load(Ordering::Relaxed),
            partial_queries: self.partial_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            cancelled_queries: self.cancelled_queries.load(Ordering::Relaxed),
            discovery_rounds: self.discovery_rounds.load(Ordering::Relaxed),
            average_latency_ms: average_latency,
            p95_latency_ms: Self::calculate_percentile(&latencies, 0.95),
            p99_latency_ms: Self::calculate_percentile(&latencies, 0.99),
            last_error: last_error.as_ref().map(|(msg, _)| msg.clone()),
            last_error_age: last_error.map(|(_, at)| at.elapsed()),
        }
    }
}

impl<T: Copy> TimeWindow<T> {
    fn new(window_size: Duration, max_len: usize) -> Self {
        Self {
            data: VecDeque::new(),
            window_size,
            max_len,
        }
    }

    fn add(&mut self, value: T) {
        self.data.push_back((Instant::now(), value));
        while self.data.len() > self.max_len {
            self.data.pop_front();
        }
        self.cleanup();
    }

    fn cleanup(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window_size) else {
            return;
        };
        while self.data.front().map_or(false, |(t, _)| *t < cutoff) {
            self.data.pop_front();
        }
    }

    fn values(&mut self) -> Vec<T> {
        self.cleanup();
        self.data.iter().map(|(_, v)| *v).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub retries: u64,
    pub error_rate: f64,
    pub total_queries: u64,
    pub partial_queries: u64,
    pub failed_queries: u64,
    pub cancelled_queries: u64,
    pub discovery_rounds: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub last_error: Option<String>,
    pub last_error_age: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_error_rate() {
        let metrics = DispatchMetrics::new();
        for _ in 0..4 {
            metrics.record_request();
        }
        metrics.record_error("connection reset".into());
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.error_rate, 0.25);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = DispatchMetrics::new();
        for ms in 1..=100 {
            metrics.record_latency(Duration::from_millis(ms));
        }
        let snapshot = metrics.snapshot();
        assert!((snapshot.average_latency_ms - 50.5).abs() < 1e-6);
        assert!((snapshot.p95_latency_ms - 95.0).abs() < 1.0);
        assert!((snapshot.p99_latency_ms - 99.0).abs() < 1.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = TimeWindow::new(Duration::from_secs(60), 3);
        for v in 0..10 {
            window.add(v);
        }
        assert_eq!(window.values(), vec![7, 8, 9]);
    }
}
