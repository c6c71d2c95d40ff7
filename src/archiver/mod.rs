//! EPICS archive retrieval: discovery, multi-archiver queries and the
//! `ArchiveAccess` façade tying them together.

pub mod access;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod index;
pub mod merge;
pub mod metrics;
pub mod point;
pub mod pool;
pub mod sequence;
pub mod transport;
pub mod types;
pub mod validation;

pub use access::ArchiveAccess;
pub use client::HttpTransport;
pub use config::{ArchiveConfig, MergePolicy};
pub use dispatcher::{Diagnostic, PendingQuery, PendingQueryInfo, QueryHandle, QueryResult};
pub use error::{ArchiverError, Result, SourceFailure};
pub use health::{ArchiveEvent, Reachability, StatusBus};
pub use index::{ArchiverRecord, RefreshOutcome, RefreshSummary};
pub use merge::{CoverageThenFreshness, FreshestIndexWins, SourceRanking};
pub use metrics::MetricsSnapshot;
pub use point::{
    format_timestamp, parse_timestamp, AlarmStatus, DataPoint, PointKind, SampleValue, Severity,
};
pub use sequence::{DataPointSequence, Gap, Statistics};
pub use transport::ArchiverTransport;
pub use types::{
    ArchiverEndpoint, ArchiverId, Coverage, PvCoverage, PvDataResponse, RetrievalMode,
    SampleRequest,
};
