use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry schedule shared by stream extraction, sink start-up and
/// reconnection.
///
/// The delay before the next attempt grows linearly with the number of
/// failures seen so far and stops growing at `max_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay unit in milliseconds
    pub base_delay_ms: u64,
    /// Cap on the linear multiplier
    pub max_multiplier: u32,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay_ms: u64, max_multiplier: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_multiplier,
        }
    }

    /// Extraction service rate limiting: 3 retries after 2s, 4s, 6s.
    pub const fn extraction() -> Self {
        Self::new(4, 2000, 3)
    }

    /// Sink start-up: immediate, then two retries 25ms apart.
    pub const fn play() -> Self {
        Self::new(3, 25, 1)
    }

    /// Reconnect cycle: 10 attempts, 1.5s / 3s / 4.5s apart.
    pub const fn reconnect() -> Self {
        Self::new(10, 1500, 3)
    }

    /// Delay to wait after `failures` failed attempts.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let multiplier = failures.min(self.max_multiplier) as u64;
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::extraction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_backoff_is_linear() {
        let policy = RetryPolicy::extraction();

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = RetryPolicy::reconnect();

        assert_eq!(policy.delay_for(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(4500));
    }

    #[test]
    fn test_play_retries_are_flat() {
        let policy = RetryPolicy::play();

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for(2), Duration::from_millis(25));
    }
}
