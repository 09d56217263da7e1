//! Structured logging setup

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Error returned when the global subscriber cannot be installed
pub type TracingInitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so operators can
/// raise verbosity for a single module without touching config files.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TracingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let builder = fmt().with_env_filter(filter).with_target(true);

    match config.format.as_str() {
        "json" => builder.json().with_current_span(false).try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    }
}
