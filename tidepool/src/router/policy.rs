//! Eviction and alarm retry policies.

use std::time::Duration;

/// Default idle timeout for objects with stored keys.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(70);

/// Default idle timeout for objects whose storage is empty.
pub const DEFAULT_EMPTY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// When an idle instance leaves memory.
///
/// An instance with a pending alarm is never evicted for idleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Idle time before eviction when the object has stored keys.
    pub idle_timeout: Duration,
    /// Idle time before eviction when the object has no stored keys.
    pub empty_idle_timeout: Duration,
}

impl EvictionPolicy {
    /// Policy with explicit timeouts.
    pub fn new(idle_timeout: Duration, empty_idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            empty_idle_timeout,
        }
    }

    /// Idle timeout that applies given whether storage is empty.
    pub fn timeout_for(&self, storage_empty: bool) -> Duration {
        if storage_empty {
            self.empty_idle_timeout
        } else {
            self.idle_timeout
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT, DEFAULT_EMPTY_IDLE_TIMEOUT)
    }
}

/// Retry schedule for failing alarm handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmPolicy {
    /// Retries after the first failed attempt. `0` disables retries.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on each further retry.
    pub initial_backoff: Duration,
}

impl AlarmPolicy {
    /// Largest delay between two retries.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(Self::MAX_BACKOFF)
    }
}

impl Default for AlarmPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_timeout_depends_on_storage() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.timeout_for(false), Duration::from_secs(70));
        assert_eq!(policy.timeout_for(true), Duration::from_secs(10));
    }

    #[test]
    fn test_alarm_backoff_doubles_and_caps() {
        let policy = AlarmPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(40), AlarmPolicy::MAX_BACKOFF);
    }
}
