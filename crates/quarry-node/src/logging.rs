use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::error::NodeError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG`, when set, wins over `level`. Pass `format = "json"` for one
/// JSON object per event; any other value gives human-readable text.
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str, format: &str) -> Result<(), NodeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .try_init()
    };
    result.map_err(|e| NodeError::Logging(e.to_string()))
}
