//! Usage: Process-wide `tracing` subscriber (stderr + optional daily-rolling file).

use crate::shared::error::AppResult;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";
const DEFAULT_FILE_PREFIX: &str = "oauth-relay.log";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    /// Directory for daily-rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: Option<String>,
}

fn configured_directives(config: &LogConfig) -> &str {
    config
        .filter
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_FILTER)
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(configured_directives(config))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber. Keep the returned guard alive for the life of the process,
/// otherwise buffered file output is lost.
pub fn init(config: &LogConfig) -> AppResult<Option<WorkerGuard>> {
    let (file_layer, guard) = match config.log_dir.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("SYSTEM_ERROR: failed to create log dir: {e}"))?;
            let prefix = config
                .file_prefix
                .as_deref()
                .unwrap_or(DEFAULT_FILE_PREFIX);
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("SYSTEM_ERROR: failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
