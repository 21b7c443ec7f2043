//! Randomized exponential backoff for worker restarts
//!
//! The delay before retry `n` (0-indexed) is `rand(0..=2^n - 1) * base`,
//! capped at `max_delay`. Retry 0 therefore restarts immediately.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
    retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            base,
            max_delay,
            max_retries,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Largest delay the next retry can draw
    pub fn ceiling(&self) -> Duration {
        let slots = 1u64.checked_shl(self.retries).unwrap_or(u64::MAX) - 1;
        self.scaled(slots)
    }

    fn scaled(&self, slots: u64) -> Duration {
        let millis = (self.base.as_millis() as u64).saturating_mul(slots);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay before the next retry, or None once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| self.retries >= max) {
            return None;
        }

        let ceiling = 1u64.checked_shl(self.retries).unwrap_or(u64::MAX) - 1;
        let slots = rand::thread_rng().gen_range(0..=ceiling);
        self.retries = self.retries.saturating_add(1);
        Some(self.scaled(slots))
    }

    /// Forget past failures after a worker ran successfully
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}
