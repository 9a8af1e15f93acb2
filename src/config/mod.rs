use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};

pub mod loader;

/// Options accepted by a throttle at construction time.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Ceiling on calls admitted but not yet completed.
    pub max_queue_depth: usize,
    /// Buffer added to every slot to absorb timer drift.
    pub slack_ms: u64,
    /// Reject units of work that complete synchronously.
    pub require_async: bool,
    /// Label used in logs and metrics.
    pub name: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            max_queue_depth: crate::DEFAULT_MAX_QUEUE_DEPTH,
            slack_ms: crate::DEFAULT_SLACK_MS,
            require_async: false,
            name: "throttle".to_string(),
        }
    }
}

impl ThrottleConfig {
    pub fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack_ms = u64::try_from(slack.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn strict(mut self) -> Self {
        self.require_async = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn slack(&self) -> Duration {
        Duration::from_millis(self.slack_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
