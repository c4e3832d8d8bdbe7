//! RateLimit port: per-user counter gate.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Ok,
    Limit,
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RateLimit: Send + Sync {
    /// Atomic increment; TTL = 24h. On infrastructure failure, degrade to
    /// `Ok` rather than blocking user traffic.
    async fn check_and_increment(&self, user_id: &str, context: Option<&str>) -> RateLimitOutcome;
}
