pub mod archiver;
pub mod constants;
pub mod export;
pub mod logging;

pub use archiver::{
    ArchiveAccess, ArchiveConfig, ArchiveEvent, ArchiverError, ArchiverTransport, DataPoint,
    DataPointSequence, HttpTransport, MergePolicy, QueryResult, RetrievalMode, Result,
};
