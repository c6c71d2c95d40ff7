use async_trait::async_trait;

use super::error::Result;
use super::types::{ArchiverEndpoint, PvCoverage, PvDataResponse, SampleRequest};

/// The two request kinds issued against an archiver. Implementations own
/// the protocol; `HttpTransport` speaks the Archiver Appliance JSON API and
/// tests inject scripted fakes.
#[async_trait]
pub trait ArchiverTransport: Send + Sync {
    /// Discovery: every PV name the archiver holds.
    async fn list_pvs(&self, archiver: &ArchiverEndpoint) -> Result<Vec<PvCoverage>>;

    /// Raw samples for one PV in `[request.start, request.end]`.
    async fn fetch_samples(
        &self,
        archiver: &ArchiverEndpoint,
        request: &SampleRequest,
    ) -> Result<PvDataResponse>;
}
