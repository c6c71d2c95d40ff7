// archiver/client.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::config::ArchiveConfig;
use super::error::{ArchiverError, Result};
use super::transport::ArchiverTransport;
use super::types::*;
use crate::constants::{DATA_PATH, DISCOVERY_PATH};

/// Archiver Appliance client over HTTP/JSON.
pub struct HttpTransport {
    client: Client,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl HttpTransport {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .build()?;

        let limiter = config
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self { client, limiter })
    }

    /// Formats a timestamp the way the archiver expects: ISO 8601 with an
    /// explicit `-00:00` offset.
    fn format_date_for_archiver(date: DateTime<Utc>) -> String {
        date.to_rfc3339()
            .replace("+00:00", "-00:00")
            .replace('Z', "-00:00")
    }

    /// Builds a URL for the API request with proper encoding
    fn build_url(archiver: &ArchiverEndpoint, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        let base = archiver.url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/{}", base, endpoint)).map_err(|e| {
            ArchiverError::Config(format!("archiver {} has invalid URL: {}", archiver.name, e))
        })?;

        url.query_pairs_mut().extend_pairs(params);
        Ok(url)
    }

    async fn get(&self, archiver: &ArchiverEndpoint, url: Url) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        debug!(archiver = %archiver.name, url = %url, "archiver request");
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_send_error(&archiver.id(), e))
    }

    async fn read_body(archiver: &ArchiverId, response: Response) -> Result<String> {
        response.text().await.map_err(|e| {
            if e.is_timeout() {
                ArchiverError::transient(archiver, format!("timed out reading body: {}", e))
            } else {
                ArchiverError::malformed(archiver, format!("unreadable body: {}", e))
            }
        })
    }
}

#[async_trait]
impl ArchiverTransport for HttpTransport {
    async fn list_pvs(&self, archiver: &ArchiverEndpoint) -> Result<Vec<PvCoverage>> {
        let id = archiver.id();
        let url = Self::build_url(archiver, DISCOVERY_PATH, &[("limit", "-1")])?;
        let response = self.get(archiver, url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&id, status, response.headers(), None));
        }

        let body = Self::read_body(&id, response).await?;
        let names: Vec<String> = serde_json::from_str(&body)
            .map_err(|e| ArchiverError::malformed(&id, format!("bad PV list: {}", e)))?;
        Ok(names.into_iter().map(PvCoverage::named).collect())
    }

    async fn fetch_samples(
        &self,
        archiver: &ArchiverEndpoint,
        request: &SampleRequest,
    ) -> Result<PvDataResponse> {
        let id = archiver.id();
        let pv_query = request.wire_pv();
        let from = Self::format_date_for_archiver(request.start);
        let to = Self::format_date_for_archiver(request.end);
        let url = Self::build_url(
            archiver,
            DATA_PATH,
            &[("pv", pv_query.as_str()), ("from", from.as_str()), ("to", to.as_str())],
        )?;

        let response = self.get(archiver, url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&id, status, response.headers(), Some(&request.pv)));
        }

        let body = Self::read_body(&id, response).await?;
        let data: Vec<PvDataResponse> = serde_json::from_str(&body)
            .map_err(|e| ArchiverError::malformed(&id, format!("failed to parse response JSON: {}", e)))?;

        data.into_iter().next().ok_or_else(|| ArchiverError::PvAbsent {
            archiver: id,
            pv: request.pv.clone(),
        })
    }
}

fn classify_send_error(archiver: &ArchiverId, e: reqwest::Error) -> ArchiverError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ArchiverError::transient(archiver, e.to_string())
    } else {
        ArchiverError::ReqwestError(e)
    }
}

fn status_error(
    archiver: &ArchiverId,
    status: StatusCode,
    headers: &HeaderMap,
    pv: Option<&str>,
) -> ArchiverError {
    match (status, pv) {
        (StatusCode::NOT_FOUND, Some(pv)) => ArchiverError::PvAbsent {
            archiver: archiver.clone(),
            pv: pv.to_string(),
        },
        (
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT,
            _,
        ) => ArchiverError::Transient {
            archiver: archiver.clone(),
            message: format!("server responded {}", status),
            retry_after: retry_after(headers),
        },
        _ => ArchiverError::ServerError {
            archiver: archiver.clone(),
            status: status.as_u16(),
            body: status.canonical_reason().map(str::to_string),
        },
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn endpoint() -> ArchiverEndpoint {
        ArchiverEndpoint::new("main", "http://archiver.example.org:17665/retrieval/")
    }

    #[test]
    fn test_format_date_for_archiver() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(HttpTransport::format_date_for_archiver(t), "2024-03-05T07:08:09-00:00");
    }

    #[test]
    fn test_build_url_encodes_operator() {
        let request = SampleRequest {
            pv: "SR:C01:CURRENT".to_string(),
            start: Utc.timestamp_opt(0, 0).unwrap(),
            end: Utc.timestamp_opt(60, 0).unwrap(),
            mode: RetrievalMode::Mean(10),
        };
        let pv = request.wire_pv();
        let url = HttpTransport::build_url(&endpoint(), DATA_PATH, &[("pv", pv.as_str())]).unwrap();
        assert_eq!(url.path(), "/retrieval/data/getData.json");
        assert_eq!(url.query(), Some("pv=mean_10%28SR%3AC01%3ACURRENT%29"));
    }

    #[test]
    fn test_discovery_url() {
        let url = HttpTransport::build_url(&endpoint(), DISCOVERY_PATH, &[("limit", "-1")]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://archiver.example.org:17665/retrieval/bpl/getAllPVs?limit=-1"
        );
    }

    #[test]
    fn test_transport_builds_with_rate_limit() {
        let config = ArchiveConfig::default().with_requests_per_second(Some(20));
        let transport = HttpTransport::new(&config).unwrap();
        assert!(transport.limiter.is_some());
    }

    fn archiver() -> ArchiverId {
        ArchiverId::new("main")
    }

    fn headers(retry_after: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, retry_after.parse().unwrap());
        headers
    }

    #[test]
    fn test_missing_pv_maps_to_pv_absent() {
        let err = status_error(&archiver(), StatusCode::NOT_FOUND, &HeaderMap::new(), Some("X"));
        assert!(matches!(err, ArchiverError::PvAbsent { ref pv, .. } if pv == "X"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_discovery_endpoint_is_server_error() {
        let err = status_error(&archiver(), StatusCode::NOT_FOUND, &HeaderMap::new(), None);
        assert!(matches!(err, ArchiverError::ServerError { status: 404, .. }));
    }

    #[test]
    fn test_unavailable_carries_retry_after() {
        let err = status_error(
            &archiver(),
            StatusCode::SERVICE_UNAVAILABLE,
            &headers("7"),
            Some("X"),
        );
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_throttled_without_header() {
        let err = status_error(
            &archiver(),
            StatusCode::TOO_MANY_REQUESTS,
            &HeaderMap::new(),
            Some("X"),
        );
        assert!(matches!(err, ArchiverError::Transient { retry_after: None, .. }));
    }

    #[test]
    fn test_retry_after_ignores_http_dates() {
        assert_eq!(retry_after(&headers(" 12 ")), Some(Duration::from_secs(12)));
        assert_eq!(retry_after(&headers("Wed, 21 Oct 2015 07:28:00 GMT")), None);
    }

    #[test]
    fn test_internal_error_is_final() {
        let err = status_error(
            &archiver(),
            StatusCode::INTERNAL_SERVER_ERROR,
            &headers("3"),
            Some("X"),
        );
        match err {
            ArchiverError::ServerError { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body.as_deref(), Some("Internal Server Error"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
