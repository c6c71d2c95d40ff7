use std::time::Duration;

// Environment variables
pub const ENV_ARCHIVE_LIST: &str = "QE_ARCHIVE_LIST";
pub const ENV_RETRY_COUNT: &str = "QE_ARCHIVE_RETRY_COUNT";
pub const ENV_MERGE_POLICY: &str = "QE_ARCHIVE_MERGE";
pub const ENV_GAP_SECS: &str = "QE_ARCHIVE_GAP_SECS";
pub const ENV_MAX_CONCURRENT: &str = "QE_ARCHIVE_MAX_CONCURRENT";

// Archiver Appliance endpoints, relative to the configured archiver URL
pub const DISCOVERY_PATH: &str = "bpl/getAllPVs";
pub const DATA_PATH: &str = "data/getData.json";

// Default configuration
pub const DEFAULT_BASE_URL: &str = "http://lcls-archapp.slac.stanford.edu/retrieval";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_COUNT: u32 = 1;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

// Event bus and metrics
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const LATENCY_WINDOW: Duration = Duration::from_secs(300);
pub const MAX_LATENCY_SAMPLES: usize = 4096;

// Validation limits
pub const MAX_PV_NAME_LEN: usize = 255;

/// Display/export timestamp layout: `dd/MMM/yyyy HH:mm:ss`.
pub const TEXT_TIMESTAMP_FORMAT: &str = "%d/%b/%Y %H:%M:%S";

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
