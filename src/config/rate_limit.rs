// src/config/rate_limit.rs
// Rate Limit + Toggle + Notifier configuration.

use serde::{Deserialize, Serialize};

use super::helpers::env_usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_per_window: i64,
    pub toggle_refresh_interval_ms: u64,
    pub notifier_window_ms: i64,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            max_per_window: env_usize("RATE_LIMIT_MAX_PER_WINDOW", 20) as i64,
            toggle_refresh_interval_ms: env_usize("LIMITS_ENABLED_REFRESH_MS", 30_000) as u64,
            notifier_window_ms: env_usize("RATE_LIMIT_NOTIFIER_WINDOW_MS", 24 * 60 * 60 * 1000)
                as i64,
        }
    }
}
