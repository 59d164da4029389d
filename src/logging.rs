use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Installs the global subscriber writing to stderr; stdout carries command
/// output. `RUST_LOG` wins over the configured level and `debug` forces the
/// debug level.
pub fn init_logging(config: &LoggingConfig, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        config.level.parse().context("Invalid log level")?
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let output = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}
