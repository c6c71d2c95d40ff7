// validation.rs

use crate::archiver::{
    error::{ArchiverError, Result},
    types::RetrievalMode,
};
use crate::constants::MAX_PV_NAME_LEN;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

// Static Patterns
static PV_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-:\.\[\]<>;{}]+$").expect("Failed to compile PV name regex")
});

const VAL_FIELD: &str = ".VAL";
const MAX_BIN_SECONDS: u32 = 86_400;

#[derive(Debug, Clone)]
pub struct Validator;

impl Validator {
    /// Canonical form used for indexing and lookup: surrounding whitespace
    /// and a trailing `.VAL` field are dropped.
    pub fn normalize_pv_name(name: &str) -> &str {
        let name = name.trim();
        name.strip_suffix(VAL_FIELD).unwrap_or(name)
    }

    pub fn validate_pv_name(name: &str) -> Result<()> {
        let mut errors = Vec::new();

        if name.is_empty() {
            errors.push("PV name cannot be empty".to_string());
        }

        if name.len() > MAX_PV_NAME_LEN {
            errors.push(format!(
                "PV name exceeds maximum length of {} characters",
                MAX_PV_NAME_LEN
            ));
        }

        if !name.is_empty() && !PV_NAME_REGEX.is_match(name) {
            errors.push("PV name contains invalid characters".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArchiverError::invalid_request(
                "Invalid PV name".to_string(),
                format!("PV: {}", name),
                errors,
            ))
        }
    }

    pub fn validate_time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        if end <= start {
            return Err(ArchiverError::invalid_request(
                "Invalid time range".to_string(),
                format!("start: {}, end: {}", start, end),
                vec!["End time must be after start time".to_string()],
            ));
        }
        Ok(())
    }

    pub fn validate_mode(mode: &RetrievalMode) -> Result<()> {
        let mut errors = Vec::new();
        match mode {
            RetrievalMode::Raw => {}
            RetrievalMode::Optimized(points) => {
                if *points == 0 {
                    errors.push("Optimized point count must be positive".to_string());
                }
            }
            RetrievalMode::Mean(bin)
            | RetrievalMode::Min(bin)
            | RetrievalMode::Max(bin)
            | RetrievalMode::FirstSample(bin)
            | RetrievalMode::LastSample(bin) => {
                if *bin == 0 {
                    errors.push("Bin size must be positive".to_string());
                }
                if *bin > MAX_BIN_SECONDS {
                    errors.push(format!(
                        "Bin size cannot exceed {} seconds (24 hours)",
                        MAX_BIN_SECONDS
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ArchiverError::invalid_request(
                "Invalid retrieval mode".to_string(),
                format!("mode: {:?}", mode),
                errors,
            ))
        }
    }

    /// Compiles a PV-name search pattern.
    pub fn compile_pattern(pattern: &str) -> Result<Regex> {
        Regex::new(pattern).map_err(|e| {
            ArchiverError::invalid_request(
                "Invalid search pattern".to_string(),
                format!("pattern: {}", pattern),
                vec![e.to_string()],
            )
        })
    }
}
