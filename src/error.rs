use thiserror::Error;

/// Error type produced by a throttled unit of work, kept as-is so callers can downcast it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    // Admission Errors
    #[error(
        "Throttle backpressure error: queue depth {pending} exceeds max {max_queue_depth} \
         (interval={interval_ms}ms, wait={wait_ms}ms)"
    )]
    Backpressure {
        pending: usize,
        max_queue_depth: usize,
        interval_ms: u64,
        wait_ms: i64,
    },

    // Execution Errors
    #[error("Throttle expects an asynchronous function")]
    InvalidCallable,

    #[error(transparent)]
    Callable(BoxError),

    #[error("Throttled call panicked: {0}")]
    Panicked(String),

    #[error("Throttled call was cancelled before it ran")]
    Cancelled,

    #[error("Throttled call requires a tokio runtime")]
    NoRuntime,

    // Configuration Errors
    #[error("Invalid throttle configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::Backpressure { .. })
    }

    /// Wraps an error returned by the unit of work.
    pub fn callable(err: impl Into<BoxError>) -> Self {
        Error::Callable(err.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::Panicked(message)
    }
}
