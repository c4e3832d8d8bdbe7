// src/config/typing.rs
// Typing Indicator configuration.

use serde::{Deserialize, Serialize};

use super::helpers::env_usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    pub refresh_interval_ms: u64,
}

impl TypingConfig {
    pub fn from_env() -> Self {
        Self {
            refresh_interval_ms: env_usize("TYPING_REFRESH_INTERVAL_MS", 4_000) as u64,
        }
    }
}
