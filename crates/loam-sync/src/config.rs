//! Replication configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the replication engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Events requested per pull page.
    pub page_size: usize,
    /// Hard cap on pages pulled in one cycle.
    pub max_pages: usize,
    /// First retry delay (in milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay (in milliseconds).
    pub max_delay_ms: u64,
    /// Failed cycles before the error is reported as persistent.
    /// Retries continue at `max_delay_ms` after that.
    pub max_retries: u32,
    /// Delay between coming online and the pull it triggers (in milliseconds).
    pub online_debounce_ms: u64,
    /// Master switch.
    pub enabled: bool,
    /// Schedule a sync after every local mutation.
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 50,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_retries: 8,
            online_debounce_ms: 500,
            enabled: true,
            auto_sync: true,
        }
    }
}

impl SyncConfig {
    /// Parse a config blob. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size.max(1);
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.config.max_pages = pages.max(1);
        self
    }

    pub fn base_delay(mut self, ms: u64) -> Self {
        self.config.base_delay_ms = ms;
        self
    }

    pub fn max_delay(mut self, ms: u64) -> Self {
        self.config.max_delay_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn online_debounce(mut self, ms: u64) -> Self {
        self.config.online_debounce_ms = ms;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
