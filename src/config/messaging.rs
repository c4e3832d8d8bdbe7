// src/config/messaging.rs
// Messaging Dispatcher + platform adapter configuration.

use serde::{Deserialize, Serialize};

use super::helpers::{env_usize, require_env};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub bot_token: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub outbound_rate_per_minute: u32,
}

impl MessagingConfig {
    pub fn from_env() -> Self {
        Self {
            bot_token: require_env("BOT_TOKEN"),
            max_retries: env_usize("DISPATCH_MAX_RETRIES", 3) as u32,
            base_delay_ms: env_usize("DISPATCH_BASE_DELAY_MS", 250) as u64,
            outbound_rate_per_minute: env_usize("DISPATCH_OUTBOUND_RATE_PER_MINUTE", 1800) as u32,
        }
    }
}
