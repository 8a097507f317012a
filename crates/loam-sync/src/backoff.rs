//! Exponential retry delays.

use crate::config::SyncConfig;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    max_retries: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, max_retries: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            max_retries,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_delay_ms, config.max_retries)
    }

    /// Delay before retry number `retry` (1-based):
    /// `min(max, base * 2^(retry - 1))`, and `max` once retries are exhausted.
    pub fn delay(&self, retry: u32) -> Duration {
        if self.is_exhausted(retry) {
            return Duration::from_millis(self.max_ms);
        }
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }

    /// Past the retry budget: the failure is reported as persistent.
    pub fn is_exhausted(&self, retry: u32) -> bool {
        retry > self.max_retries
    }
}
