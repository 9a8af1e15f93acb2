pub mod error;
pub mod config;
pub mod scheduler;
pub mod adapter;
pub mod observability;

pub use adapter::method::ThrottledMethod;
pub use config::ThrottleConfig;
pub use error::{Error, Result};
pub use scheduler::{make_throttled, Deferred, Throttle, Work};

// Queue ceiling used when none is configured
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;

// Slack added to every slot, in milliseconds
pub const DEFAULT_SLACK_MS: u64 = 50;
