// error.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::types::ArchiverId;

/// Failure of one archiver source within a query, after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub archiver: ArchiverId,
    pub attempts: u32,
    pub retryable: bool,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("PV {pv} not found in archive")]
    NotFound { pv: String },

    #[error("Transient failure on {archiver}: {message}")]
    Transient {
        archiver: ArchiverId,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Malformed response from {archiver}: {message}")]
    Malformed { archiver: ArchiverId, message: String },

    #[error("Archiver {archiver} does not hold PV {pv}")]
    PvAbsent { archiver: ArchiverId, pv: String },

    #[error("Server error from {archiver} (status: {status})")]
    ServerError {
        archiver: ArchiverId,
        status: u16,
        body: Option<String>,
    },

    #[error("All {} archivers failed for {pv}", failures.len())]
    TotalFailure {
        pv: String,
        failures: Vec<SourceFailure>,
    },

    #[error("Query {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: String,
        validation_errors: Vec<String>,
    },

    #[error("Archive access has been shut down")]
    ShutDown,

    #[error("Index refresh did not complete: {0}")]
    RefreshFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    CsvError(#[from] csv::Error),

    #[error(transparent)]
    FmtError(#[from] std::fmt::Error),
}

impl ArchiverError {
    /// Returns true if the error is likely transient and the request can be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::ServerError { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            Self::ReqwestError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Returns a suggested retry delay if the server supplied one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns true if the error aborts the caller's request rather than
    /// being absorbed into diagnostics.
    pub fn is_fatal_to_caller(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::TotalFailure { .. }
                | Self::Cancelled(_)
                | Self::InvalidRequest { .. }
                | Self::ShutDown
        )
    }

    pub fn transient<T: Into<String>>(archiver: &ArchiverId, message: T) -> Self {
        Self::Transient {
            archiver: archiver.clone(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn malformed<T: Into<String>>(archiver: &ArchiverId, message: T) -> Self {
        Self::Malformed {
            archiver: archiver.clone(),
            message: message.into(),
        }
    }

    pub fn invalid_request<T: Into<String>>(message: T, context: T, errors: Vec<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: context.into(),
            validation_errors: errors,
        }
    }

    /// Collapses the error into a per-source failure record.
    pub fn into_source_failure(self, archiver: &ArchiverId, attempts: u32) -> SourceFailure {
        SourceFailure {
            archiver: archiver.clone(),
            attempts,
            retryable: self.is_retryable(),
            message: self.to_string(),
        }
    }
}

/// Result type alias for ArchiverError
pub type Result<T> = std::result::Result<T, ArchiverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ArchiverId {
        ArchiverId::from("arch-a")
    }

    #[test]
    fn test_transient_is_retryable() {
        let err = ArchiverError::transient(&id(), "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal_to_caller());
    }

    #[test]
    fn test_malformed_is_permanent() {
        let err = ArchiverError::malformed(&id(), "unexpected token");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_error_classification() {
        let unavailable = ArchiverError::ServerError {
            archiver: id(),
            status: 503,
            body: None,
        };
        let bad_request = ArchiverError::ServerError {
            archiver: id(),
            status: 400,
            body: None,
        };
        assert!(unavailable.is_retryable());
        assert!(!bad_request.is_retryable());
    }

    #[test]
    fn test_total_failure_message_counts_sources() {
        let failures = vec![
            ArchiverError::transient(&id(), "timeout").into_source_failure(&id(), 2),
            ArchiverError::malformed(&ArchiverId::from("arch-b"), "bad json")
                .into_source_failure(&ArchiverId::from("arch-b"), 1),
        ];
        let err = ArchiverError::TotalFailure {
            pv: "TEST:PV1".to_string(),
            failures,
        };
        assert_eq!(err.to_string(), "All 2 archivers failed for TEST:PV1");
        assert!(err.is_fatal_to_caller());
    }

    #[test]
    fn test_source_failure_keeps_retry_classification() {
        let failure = ArchiverError::transient(&id(), "timeout").into_source_failure(&id(), 2);
        assert!(failure.retryable);
        assert_eq!(failure.attempts, 2);
        assert!(failure.message.contains("timeout"));
    }
}
