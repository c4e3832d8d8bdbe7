// src/config/admin.rs
// Admin Command Gate configuration.

use serde::{Deserialize, Serialize};

use super::helpers::{env_or, env_usize, require_env};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub admin_token: String,
    pub export_admin_token: Option<String>,
    pub whitelist_cache_ttl_ms: u64,
}

impl AdminConfig {
    pub fn from_env() -> Self {
        let export_admin_token = env_or("EXPORT_ADMIN_TOKEN", "");
        Self {
            admin_token: require_env("ADMIN_TOKEN"),
            export_admin_token: if export_admin_token.is_empty() {
                None
            } else {
                Some(export_admin_token)
            },
            whitelist_cache_ttl_ms: env_usize("ADMIN_WHITELIST_CACHE_TTL_MS", 30_000) as u64,
        }
    }
}
