// src/config/mod.rs
// Central configuration: one struct per concern, composed into `Config`.
//
// No module-level singleton — `Config` is built once in `main` via
// `Config::from_env()` and threaded down through Composition as an
// `Arc<Config>`, rather than a `lazy_static! { pub static ref CONFIG }` singleton.

pub mod admin;
pub mod helpers;
pub mod messaging;
pub mod rate_limit;
pub mod server;
pub mod typing;

use crate::ai_queue::config::AiQueueConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: server::ServerConfig,
    pub database: server::DatabaseConfig,
    pub logging: server::LoggingConfig,
    pub ai_queue: AiQueueConfig,
    pub messaging: messaging::MessagingConfig,
    pub rate_limit: rate_limit::RateLimitConfig,
    pub admin: admin::AdminConfig,
    pub typing: typing::TypingConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            server: server::ServerConfig::from_env(),
            database: server::DatabaseConfig::from_env(),
            logging: server::LoggingConfig::from_env(),
            ai_queue: AiQueueConfig::from_env(),
            messaging: messaging::MessagingConfig::from_env(),
            rate_limit: rate_limit::RateLimitConfig::from_env(),
            admin: admin::AdminConfig::from_env(),
            typing: typing::TypingConfig::from_env(),
        }
    }

    /// Checked once at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must not be empty");
        }
        if self.ai_queue.base_urls.is_empty() {
            anyhow::bail!("AI_QUEUE_BASE_URLS must list at least one endpoint");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        self.server.bind_address()
    }
}
