use std::time::Duration;

use crate::reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, ReconnectPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub log_filter: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,realtime_mux=debug".into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl MuxConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source; unset or
    /// unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let log_filter = lookup("RUST_LOG")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.log_filter);
        let max_attempts = lookup("TRACKER_REALTIME_MAX_ATTEMPTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);
        let base_delay_ms = lookup("TRACKER_REALTIME_BASE_DELAY_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.base_delay_ms);
        let max_delay_ms = lookup("TRACKER_REALTIME_MAX_DELAY_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_delay_ms);
        Self {
            log_filter,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }
}
