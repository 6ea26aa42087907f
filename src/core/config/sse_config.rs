use log::warn;
use std::time::Duration;

use super::env_parse;

/// Limits for the SDR activity stream. One polling loop per connection.
#[derive(Clone, Debug)]
pub struct SseConfig {
    pub poll_interval_ms: u64,

    pub max_lifetime_secs: u64,

    pub heartbeat_secs: u64,

    pub batch_size: i64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_lifetime_secs: 30,
            heartbeat_secs: 15,
            batch_size: 50,
        }
    }
}

impl SseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            poll_interval_ms: env_parse("SSE_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            max_lifetime_secs: env_parse("SSE_MAX_LIFETIME_SECS", defaults.max_lifetime_secs),
            heartbeat_secs: env_parse("SSE_HEARTBEAT_SECS", defaults.heartbeat_secs),
            batch_size: env_parse("SSE_BATCH_SIZE", defaults.batch_size),
        };

        if config.poll_interval_ms < 250 {
            warn!(
                "SSE poll interval {}ms is too low, setting to minimum of 250ms",
                config.poll_interval_ms
            );
            config.poll_interval_ms = 250;
        }

        if config.max_lifetime_secs == 0 {
            config.max_lifetime_secs = defaults.max_lifetime_secs;
        }

        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
