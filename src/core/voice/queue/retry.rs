//! Retry policy and the clock the worker sleeps on.

use std::time::{Duration, Instant};

/// Exponential backoff between provider attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per task, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after attempt number `failed_attempt` (1-based) failed:
    /// `base * 2^(failed_attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Time source for retry sleeps, injectable for tests.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Tokio-backed clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Clock that records requested sleeps and returns immediately.
    #[derive(Default)]
    pub struct RecordingClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl RecordingClock {
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Clock for RecordingClock {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            tokio::task::yield_now().await;
        }
    }
}
