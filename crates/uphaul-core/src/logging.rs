//! Tracing integration for structured logging.
//!
//! One entry point for the CLI and tests: configurable verbosity, optional
//! append-mode log file, text or JSON output.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Initialize the logging system.
///
/// `verbosity` maps 0=error, 1=warn, 2=info, 3=debug, 4+=trace; `RUST_LOG`
/// overrides it when set. With a `log_file` the output is appended there
/// with ANSI disabled, otherwise it goes to stderr.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("uphaul={level},uphaul_core={level}")));

    let registry = tracing_subscriber::registry().with(filter);
    let detail = verbosity >= 3;

    let init_result = match log_file {
        None => match format {
            LogFormat::Text => registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(detail)
                        .with_line_number(detail),
                )
                .try_init(),
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        },
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            match format {
                LogFormat::Text => registry
                    .with(
                        fmt::layer()
                            .with_writer(file)
                            .with_ansi(false)
                            .with_target(true)
                            .with_file(detail)
                            .with_line_number(detail),
                    )
                    .try_init(),
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_writer(file))
                    .try_init(),
            }
        }
    };

    init_result.map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (a subscriber may already be installed).
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}
