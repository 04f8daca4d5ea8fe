//! Retry bookkeeping: exponential backoff with jitter and the per-event
//! attempt ledger.
//!
//! The timer that acts on these lives in [`crate::agent`]; this module only
//! holds the state and the arithmetic so both can be tested without a clock.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::config::AgentConfig;
use crate::types::Event;

/// Retry tuning derived from [`AgentConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before an event is dropped.
    pub max_attempts: u32,
    /// Initial backoff.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Jitter is drawn from `[0, jitter)`.
    pub jitter: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    /// Millisecond delays and no jitter, for tests against a live endpoint.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.base_delay,
            policy,
        }
    }

    /// Delay before the next retry: the capped backoff plus random jitter.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.current.min(self.policy.max_delay) + self.jitter()
    }

    /// Doubles the backoff up to the cap.
    pub fn advance(&mut self) {
        self.current = self
            .current
            .saturating_mul(2)
            .min(self.policy.max_delay);
    }

    /// Restores the initial backoff.
    pub fn reset(&mut self) {
        self.current = self.policy.base_delay;
    }

    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    fn jitter(&self) -> Duration {
        let bound = self.policy.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..bound))
    }
}

/// Outcome of recording a failed attempt for a batch of events.
#[derive(Debug, Default)]
pub struct RetryPartition {
    /// Events still eligible for another attempt, in their original order.
    pub retry: Vec<Event>,
    /// Events over the attempt limit, with the attempt count reached.
    pub exhausted: Vec<(Event, u32)>,
}

/// Per-event attempt counts, keyed by event ID.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: HashMap<String, u32>,
    max_attempts: u32,
}

impl RetryLedger {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            max_attempts,
        }
    }

    /// Counts one more failed attempt for each event.
    ///
    /// Events whose count exceeds the limit lose their ledger entry and are
    /// returned as exhausted; the rest keep their order.
    pub fn record_failures(&mut self, events: Vec<Event>) -> RetryPartition {
        let mut partition = RetryPartition::default();

        for event in events {
            let count = self
                .attempts
                .get(event.event_id())
                .copied()
                .unwrap_or(0)
                + 1;

            if count > self.max_attempts {
                self.attempts.remove(event.event_id());
                partition.exhausted.push((event, count));
            } else {
                self.attempts.insert(event.event_id().to_string(), count);
                partition.retry.push(event);
            }
        }

        partition
    }

    /// Forgets an event (delivered or permanently dropped).
    pub fn resolve(&mut self, event_id: &str) {
        self.attempts.remove(event_id);
    }

    /// Failed attempts recorded so far for an event.
    #[must_use]
    pub fn attempts(&self, event_id: &str) -> Option<u32> {
        self.attempts.get(event_id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
