//! Logging setup for binaries and applications embedding the crate.

use crate::{ConveyorError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, `config.level` otherwise.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => directives,
        _ => config.level.clone(),
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| ConveyorError::Config(format!("Invalid log filter {:?}: {}", directives, e)))
}

/// Install a global `fmt` subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_level(true)
        .try_init()
        .map_err(|e| ConveyorError::Config(format!("Failed to initialize logging: {}", e)))
}
