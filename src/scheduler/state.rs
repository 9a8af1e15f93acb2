use std::time::Duration;
use tokio::time::Instant;
use crate::error::{Error, Result};

/// Timing and queue accounting owned by one throttle.
///
/// `admit` is the whole decision step: it reads the clock, reserves the
/// next slot and counts the call in one pass, so callers only need to hold
/// the surrounding lock for its duration.
#[derive(Debug)]
pub struct ThrottleState {
    next_allowed: Option<Instant>,
    pending: usize,
    admitted: u64,
    interval: Duration,
    slack: Duration,
    max_queue_depth: usize,
}

/// A call accepted by [`ThrottleState::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub seq: u64,
    /// Scheduled start of the unit of work.
    pub start_at: Instant,
    pub wait: Duration,
    /// Pending count including this call.
    pub pending: usize,
}

impl Admission {
    pub fn is_immediate(&self) -> bool {
        self.wait.is_zero()
    }
}

/// Read-only copy of a throttle's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub next_allowed: Option<Instant>,
    pub pending: usize,
    pub interval: Duration,
    pub max_queue_depth: usize,
}

impl ThrottleState {
    pub fn new(interval: Duration, slack: Duration, max_queue_depth: usize) -> Self {
        ThrottleState {
            next_allowed: None,
            pending: 0,
            admitted: 0,
            interval,
            slack,
            max_queue_depth,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Result<Admission> {
        let wait_ms = match self.next_allowed {
            Some(next) if next > now => signed_millis(next - now),
            Some(next) => -signed_millis(now - next),
            None => 0,
        };

        // A slot in the past is clamped to now, otherwise an idle throttle
        // would let a burst through back-to-back.
        let start_at = self.next_allowed.map_or(now, |next| next.max(now));
        let next_allowed = self.interval
            .checked_add(self.slack)
            .and_then(|step| start_at.checked_add(step))
            .ok_or_else(|| {
                Error::InvalidConfig("interval is too large to schedule another call".to_string())
            })?;
        self.next_allowed = Some(next_allowed);

        self.pending += 1;
        if self.pending > self.max_queue_depth {
            let pending = self.pending;
            self.pending -= 1;
            return Err(Error::Backpressure {
                pending,
                max_queue_depth: self.max_queue_depth,
                interval_ms: self.interval.as_millis() as u64,
                wait_ms,
            });
        }

        self.admitted += 1;
        Ok(Admission {
            seq: self.admitted,
            start_at,
            wait: start_at.saturating_duration_since(now),
            pending: self.pending,
        })
    }

    /// Marks one admitted call as finished, returning the remaining count.
    pub fn release(&mut self) -> usize {
        self.pending = self.pending.saturating_sub(1);
        self.pending
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        ThrottleSnapshot {
            next_allowed: self.next_allowed,
            pending: self.pending,
            interval: self.interval,
            max_queue_depth: self.max_queue_depth,
        }
    }
}

fn signed_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Whether a throttle with this spacing can reserve at least one slot past `now`.
pub fn fits_schedule(now: Instant, interval: Duration, slack: Duration) -> bool {
    interval
        .checked_add(slack)
        .and_then(|step| now.checked_add(step))
        .is_some()
}
