//! Bounded exponential backoff for reconnect loops
//!
//! Delays start at `min_delay`, multiply after every failure and saturate at
//! `max_delay`. There is no jitter: the sequence is monotonic and bounded so
//! a slave's reconnect cadence is predictable.

use std::time::Duration;

/// Backoff parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay after a failure, and the delay after a reset
    pub min_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Growth factor applied after each failure
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

/// Stateful delay sequence driven by a [`BackoffPolicy`]
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
}

impl Backoff {
    /// Create a backoff positioned at the policy's minimum delay
    ///
    /// A `min_delay` above `max_delay` is clamped down to `max_delay`.
    pub fn new(mut policy: BackoffPolicy) -> Self {
        if policy.min_delay > policy.max_delay {
            policy.min_delay = policy.max_delay;
        }
        policy.multiplier = policy.multiplier.max(1);
        let next = policy.min_delay;
        Self { policy, next }
    }

    /// Return the delay to wait now and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(
            self.next.saturating_mul(self.policy.multiplier),
            self.policy.max_delay,
        );
        delay
    }

    /// Delay that the next call to [`next_delay`](Self::next_delay) returns
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Return to the minimum delay
    pub fn reset(&mut self) {
        self.next = self.policy.min_delay;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
