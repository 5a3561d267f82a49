//! Logging setup for the batch-enrich binary.

use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

/// Initialize logging to stderr so stdout stays clean for the summary.
///
/// `RUST_LOG` takes precedence over `level` when it is set and valid.
pub fn init_logging(level: LogLevel) {
    let level: tracing::Level = level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
