use crate::config::helpers::{env_or, env_usize, require_env};

#[derive(Debug, Clone)]
pub struct AiQueueConfig {
    pub max_concurrency: usize,
    pub max_queue_size: usize,
    pub request_timeout_ms: u64,
    pub retry_max: u32,
    pub endpoint_failover_threshold: u32,
    pub base_urls: Vec<String>,
    pub assistant_id: String,
    pub model: String,
}

impl AiQueueConfig {
    pub fn from_env() -> Self {
        let base_urls_raw = env_or("AI_QUEUE_BASE_URLS", "https://api.openai.com/v1/responses");
        let base_urls = base_urls_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            max_concurrency: env_usize("AI_QUEUE_MAX_CONCURRENCY", 8),
            max_queue_size: env_usize("AI_QUEUE_MAX_QUEUE_SIZE", 64),
            request_timeout_ms: env_usize("AI_QUEUE_REQUEST_TIMEOUT_MS", 20_000) as u64,
            retry_max: env_usize("AI_QUEUE_RETRY_MAX", 2) as u32,
            endpoint_failover_threshold: env_usize("AI_QUEUE_ENDPOINT_FAILOVER_THRESHOLD", 3) as u32,
            base_urls,
            assistant_id: require_env("AI_ASSISTANT_ID"),
            model: env_or("AI_MODEL", "gpt-5"),
        }
    }
}
