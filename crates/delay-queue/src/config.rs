use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_QUEUE_NAME: &str = "sandbox-lifecycle";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Namespace for the store keys.
    pub queue_name: String,
    /// Handler failures tolerated before a message is dead-lettered.
    pub max_retries: u32,
    /// Due messages fetched per poll.
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Sleep after a failed poll iteration.
    pub error_backoff: Duration,
    /// Retry N of a failed message waits `retry_base_delay * 2^N`.
    pub retry_base_delay: Duration,
    /// How long a claimed message is hidden from other consumers.
    pub claim_lease: Duration,
    pub store_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            max_retries: 3,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(60),
            claim_lease: Duration::from_secs(300),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Delay before redelivering a message that has failed `attempts` times.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_from_base() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(120));
        assert_eq!(config.retry_delay(2), Duration::from_secs(240));
        assert_eq!(config.retry_delay(3), Duration::from_secs(480));
    }

    #[test]
    fn retry_delay_saturates() {
        let config = SchedulerConfig::default();
        assert_eq!(
            config.retry_delay(200),
            Duration::from_secs(60).saturating_mul(u32::MAX)
        );
    }
}
