//! Tracing subscriber setup.
//!
//! Installs a global registry with an `EnvFilter`, a console layer and, when
//! a log directory is configured, a non-blocking daily rolling file layer.
//! `RUST_LOG` takes precedence over the configured filter.

use crate::config::LoggingConfig;
use crate::error::{GraphError, GraphResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Returns the file writer guard when a file layer was installed; buffered
/// lines are flushed when it is dropped, so hold it for the program's
/// lifetime.
pub fn init(config: &LoggingConfig) -> GraphResult<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            GraphError::Config(format!("Invalid log filter {:?}: {}", config.filter, e))
        })?,
    };

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|e| {
                GraphError::Config(format!("Failed to create log directory {:?}: {}", directory, e))
            })?;
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(config.ansi))
        .with(file_layer)
        .try_init()
        .map_err(|e| GraphError::Config(format!("Failed to install logger: {}", e)))?;

    tracing::debug!(filter = %config.filter, file = config.directory.is_some(), "Logging initialised");
    Ok(guard)
}
