//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::ResetSettings;

/// Policy for exponential backoff retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Exactly one attempt, no retries.
    pub fn once() -> Self {
        Self::new(0, 0, 1)
    }

    /// Backoff for individual disable/enable steps.
    pub fn for_steps(settings: &ResetSettings) -> Self {
        Self::new(
            settings.retry_base_delay_ms,
            settings.retry_max_delay_ms,
            settings.step_attempts,
        )
    }

    /// Backoff for orchestrator-level reconnects.
    pub fn for_connects(settings: &ResetSettings) -> Self {
        Self::new(
            settings.retry_base_delay_ms,
            settings.retry_max_delay_ms,
            settings.connect_attempts,
        )
    }

    /// Whether another attempt may follow attempt number `attempt` (0-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Calculate the backoff delay for a given attempt (0-based) with jitter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay_ms = self.raw_delay_ms(attempt);
        let jittered_ms = Self::apply_jitter(delay_ms);
        Duration::from_millis(jittered_ms.min(self.max_delay_ms))
    }

    fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        delay.min(self.max_delay_ms)
    }

    fn apply_jitter(delay_ms: u64) -> u64 {
        if delay_ms == 0 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let jitter: f64 = rng.gen_range(0.9..=1.1);
        ((delay_ms as f64) * jitter).round().max(0.0) as u64
    }
}
