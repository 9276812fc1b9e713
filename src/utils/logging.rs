//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry from [`LoggingConfig`]: an
//! `EnvFilter` (the `RUST_LOG` variable wins over the configured level), a
//! console layer and an optional append-only file layer. Rotation is left to
//! the host.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Initialize global logging. Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let console = config.log_to_console.then(|| {
        if config.json_format {
            fmt::layer().json().with_target(false).boxed()
        } else {
            fmt::layer().with_target(false).boxed()
        }
    });

    let file = match (config.log_to_file, &config.log_file_path) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file));
            Some(if config.json_format {
                layer.json().boxed()
            } else {
                layer.boxed()
            })
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))
}
