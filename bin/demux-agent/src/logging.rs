//! Logging.
use demux_core::{config::GenericConfiguration, error::GenericError};
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _};

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Level filtering directives, such as `info` or `demux_core=debug,info`.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    log_level: String,

    /// Whether to log as JSON rather than as human-readable text.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard output from a background thread. The returned guard flushes pending logs when dropped,
/// and must be held for as long as the process logs.
///
/// # Errors
///
/// If the level directives are invalid, or logging was already initialized, an error is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<WorkerGuard, GenericError> {
    let level_filter = EnvFilter::builder().parse(&config.log_level)?;
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    if config.log_format_json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(level_filter),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(level_filter),
            )
            .try_init()?;
    }

    Ok(guard)
}
