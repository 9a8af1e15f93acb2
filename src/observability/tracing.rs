use tracing::Span;
use tracing_subscriber::EnvFilter;
use crate::config::loader::LoggingConfig;
use crate::error::{Error, Result};

pub fn trace_throttled_call(throttle: &str, seq: u64) -> Span {
    tracing::info_span!(
        "throttled_call",
        throttle = %throttle,
        seq = seq,
    )
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .map_err(|e| Error::ConfigError(e.to_string()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::ConfigError(e.to_string()))
}
