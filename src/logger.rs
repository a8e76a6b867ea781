//! Tracing subscriber setup for the binary and embedders.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{FurrowError, Result};

/// Installs the global subscriber: compact stdout output filtered by `RUST_LOG`, or by the
/// configured level when unset, plus a daily rolling file when a log directory is configured.
/// The returned guard flushes the file writer and must live as long as the process.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| FurrowError::InvalidConfig(format!("log level: {}", e)))?,
    };

    let (file, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::new().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::Layer::new().compact().with_writer(std::io::stdout))
        .with(file);
    tracing::subscriber::set_global_default(subscriber).map_err(FurrowError::internal)?;
    Ok(guard)
}
