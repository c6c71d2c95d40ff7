//! Process-wide tracing setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::archiver::error::{ArchiverError, Result};

/// Installs the global subscriber. `RUST_LOG` overrides `level` when set.
/// Fails if a subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ArchiverError::Config(format!("tracing init failed: {}", e)))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ArchiverError::Config(format!("tracing init failed: {}", e)))?;
    }

    tracing::debug!(level, json, "tracing initialized");
    Ok(())
}
