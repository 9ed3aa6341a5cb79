//! Multi-layer tracing setup: daily-rotated text and JSON files plus a
//! compact stdout layer, all filtered by `RUST_LOG` (default `info`).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const TEXT_LOG_PREFIX: &str = "quadscan.log";
pub const JSON_LOG_PREFIX: &str = "quadscan.json.log";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Guards for the non-blocking file writers. Dropping them flushes and
/// stops the writer threads, so hold on to them for the life of the process.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _text: WorkerGuard,
    _json: WorkerGuard,
}

/// Install the global subscriber writing to `log_dir`.
///
/// `RUST_LOG=quadscan=debug,reqwest=warn` style directives are honored.
pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<LogGuards, LoggingError> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info")?,
    };

    let (text_writer, text_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_path, TEXT_LOG_PREFIX));
    let (json_writer, json_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_path, JSON_LOG_PREFIX));

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    tracing::info!(dir = %log_path.display(), "logging initialized");
    Ok(LogGuards {
        _text: text_guard,
        _json: json_guard,
    })
}

/// Logs go to `<data_dir>/logs`.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(data_dir: P) -> Result<LogGuards, LoggingError> {
    init_logging(data_dir.as_ref().join("logs"))
}
