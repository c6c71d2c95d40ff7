//! Named configuration for archive access.
//!
//! Settings come from code (`Default` plus `with_*`), from the environment
//! (`from_env`) or from a JSON file (`from_json_file`). Durations in files
//! use humantime syntax such as `"30s"` or `"250ms"`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use super::error::{ArchiverError, Result};
use super::types::ArchiverEndpoint;
use crate::constants::*;

/// How responses from several archivers holding the same PV are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The first successful response wins; remaining requests are discarded.
    #[default]
    FirstSuccess,
    /// Wait for every candidate and merge overlapping coverage.
    MergeAll,
}

impl FromStr for MergePolicy {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_success" => Ok(MergePolicy::FirstSuccess),
            "merge" | "merge_all" => Ok(MergePolicy::MergeAll),
            other => Err(ArchiverError::Config(format!(
                "unknown merge policy '{}', expected 'first' or 'merge'",
                other
            ))),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::FirstSuccess => f.write_str("first"),
            MergePolicy::MergeAll => f.write_str("merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub archivers: Vec<ArchiverEndpoint>,
    /// Retries per source after the first attempt, transient failures only.
    pub retry_count: u32,
    pub merge_policy: MergePolicy,
    /// Expected sampling period; longer silences get a gap marker. `None`
    /// (the default) disables gap marking.
    #[serde(with = "humantime_serde")]
    pub gap_threshold: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Size of the worker pool shared by discovery and queries.
    pub max_concurrent_requests: usize,
    pub requests_per_second: Option<u32>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archivers: Vec::new(),
            retry_count: DEFAULT_RETRY_COUNT,
            merge_policy: MergePolicy::default(),
            gap_threshold: None,
            request_timeout: DEFAULT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            requests_per_second: None,
        }
    }
}

impl ArchiveConfig {
    pub fn with_archiver<N: Into<String>, U: Into<String>>(mut self, name: N, url: U) -> Self {
        self.archivers.push(ArchiverEndpoint::new(name, url));
        self
    }

    pub fn with_archivers(mut self, archivers: Vec<ArchiverEndpoint>) -> Self {
        self.archivers = archivers;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_gap_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.gap_threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_requests_per_second(mut self, rps: Option<u32>) -> Self {
        self.requests_per_second = rps;
        self
    }

    /// Builds a configuration from `QE_ARCHIVE_*` environment variables on
    /// top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(list) = lookup(ENV_ARCHIVE_LIST) {
            config.archivers = parse_archive_list(&list)?;
        }
        if let Some(value) = lookup(ENV_RETRY_COUNT) {
            config.retry_count = parse_env(ENV_RETRY_COUNT, &value)?;
        }
        if let Some(value) = lookup(ENV_MERGE_POLICY) {
            config.merge_policy = value.parse()?;
        }
        if let Some(value) = lookup(ENV_GAP_SECS) {
            let secs: u64 = parse_env(ENV_GAP_SECS, &value)?;
            config.gap_threshold = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            config.max_concurrent_requests = parse_env(ENV_MAX_CONCURRENT, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for archiver in &self.archivers {
            let url = Url::parse(&archiver.url).map_err(|e| {
                ArchiverError::Config(format!("archiver '{}' has invalid URL: {}", archiver.name, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ArchiverError::Config(format!(
                    "archiver '{}' must use http or https, got '{}'",
                    archiver.name,
                    url.scheme()
                )));
            }
            if archiver.name.is_empty() {
                return Err(ArchiverError::Config(format!(
                    "archiver at {} has an empty name",
                    archiver.url
                )));
            }
            if !seen.insert(archiver.name.as_str()) {
                return Err(ArchiverError::Config(format!(
                    "duplicate archiver name '{}'",
                    archiver.name
                )));
            }
        }

        if self.max_concurrent_requests == 0 {
            return Err(ArchiverError::Config(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.requests_per_second == Some(0) {
            return Err(ArchiverError::Config(
                "requests_per_second must be positive when set".into(),
            ));
        }
        if self.gap_threshold == Some(Duration::ZERO) {
            return Err(ArchiverError::Config("gap_threshold must be positive".into()));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ArchiverError::Config(format!("{} has invalid value '{}'", key, value)))
}

/// Parses a whitespace- or comma-separated list of `url` or `name=url`
/// entries. Unnamed entries are named after their host; clashing host names
/// get a numeric suffix.
fn parse_archive_list(list: &str) -> Result<Vec<ArchiverEndpoint>> {
    let mut endpoints: Vec<ArchiverEndpoint> = Vec::new();
    let entries = list
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|entry| !entry.is_empty());

    for entry in entries {
        let (name, url) = match entry.split_once('=') {
            Some((name, url)) if !name.contains("://") => (Some(name.to_string()), url),
            _ => (None, entry),
        };
        let parsed = Url::parse(url)
            .map_err(|e| ArchiverError::Config(format!("invalid archiver URL '{}': {}", url, e)))?;

        let name = match name {
            Some(name) => name,
            None => {
                let host = parsed.host_str().unwrap_or("archiver").to_string();
                let mut candidate = host.clone();
                let mut n = 2;
                while endpoints.iter().any(|e| e.name == candidate) {
                    candidate = format!("{}-{}", host, n);
                    n += 1;
                }
                candidate
            }
        };
        endpoints.push(ArchiverEndpoint::new(name, url.trim_end_matches('/')));
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::default();
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.merge_policy, MergePolicy::FirstSuccess);
        assert_eq!(config.gap_threshold, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_archive_list() {
        let config = ArchiveConfig::from_lookup(lookup(&[
            (
                ENV_ARCHIVE_LIST,
                "http://arch1.example.org/retrieval, backup=http://arch2.example.org/retrieval/ http://arch1.example.org:8080/retrieval",
            ),
            (ENV_RETRY_COUNT, "3"),
            (ENV_MERGE_POLICY, "merge"),
            (ENV_GAP_SECS, "0"),
        ]))
        .unwrap();

        let names: Vec<&str> = config.archivers.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["arch1.example.org", "backup", "arch1.example.org-2"]);
        assert_eq!(config.archivers[1].url, "http://arch2.example.org/retrieval");
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.merge_policy, MergePolicy::MergeAll);
        assert_eq!(config.gap_threshold, None);
    }

    #[test]
    fn test_env_rejects_garbage() {
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_RETRY_COUNT, "many")])).is_err());
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_MERGE_POLICY, "best")])).is_err());
        assert!(ArchiveConfig::from_lookup(lookup(&[(ENV_ARCHIVE_LIST, "not a url")])).is_err());
    }

    #[test]
    fn test_json_uses_humantime_durations() {
        let json = r#"{
            "archivers": [{"name": "main", "url": "http://archiver:17665/retrieval"}],
            "merge_policy": "merge_all",
            "request_timeout": "5s",
            "retry_backoff": "100ms",
            "gap_threshold": "2m"
        }"#;
        let config: ArchiveConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_backoff, Duration::from_millis(100));
        assert_eq!(config.gap_threshold, Some(Duration::from_secs(120)));
        assert_eq!(config.retry_count, DEFAULT_RETRY_COUNT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let duplicate = ArchiveConfig::default()
            .with_archiver("a", "http://one/retrieval")
            .with_archiver("a", "http://two/retrieval");
        assert!(duplicate.validate().is_err());

        let ftp = ArchiveConfig::default().with_archiver("a", "ftp://one/retrieval");
        assert!(ftp.validate().is_err());

        let no_pool = ArchiveConfig::default().with_max_concurrent_requests(0);
        assert!(matches!(no_pool.validate(), Err(ArchiverError::Config(_))));
    }
}
