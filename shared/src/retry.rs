//! Bounded redelivery for failed deliveries.
//!
//! A delivery that fails with a retryable error is requeued after an
//! exponential backoff. Once it has failed `max_attempts` times it is
//! rejected without requeue, which the broker routes to the dead-letter
//! queue.

use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total deliveries allowed for one message, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the redelivery that follows failure number `attempt`
    /// (zero-based): `initial_delay * multiplier^attempt`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// `failures` is the number of failed deliveries so far.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Failure counts per message, local to this process. AMQP classic queues
/// only expose a boolean `redelivered` flag, so the count lives here and is
/// forgotten on restart.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    failures: DashMap<String, u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and returns the total for this key.
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn clear(&self, key: &str) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|entry| *entry).unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
